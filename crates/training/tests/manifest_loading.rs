use image::{Rgb, RgbImage};
use std::fs;
use std::path::Path;
use training::dataset::{LandmarkDatasetConfig, LandmarkManifest, LandmarkRecord};
use training::TrainError;

fn write_image(dir: &Path, name: &str) {
    let mut img = RgbImage::new(40, 20);
    for (x, _, px) in img.enumerate_pixels_mut() {
        *px = Rgb([(x * 6) as u8, 128, 255]);
    }
    img.save(dir.join(name)).unwrap();
}

fn write_manifest(dir: &Path, records: Vec<LandmarkRecord>) -> std::path::PathBuf {
    let path = dir.join("manifest.json");
    let manifest = LandmarkManifest { samples: records };
    fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
    path
}

fn config(manifest: std::path::PathBuf) -> LandmarkDatasetConfig {
    LandmarkDatasetConfig {
        manifest,
        root: None,
        input_size: 16,
        sigma: 1.0,
        num_classes: 2,
    }
}

#[test]
fn decodes_images_and_renders_quarter_resolution_heatmaps() {
    let tmp = tempfile::tempdir().unwrap();
    let mut records = Vec::new();
    for i in 0..3 {
        let name = format!("face_{i}.png");
        write_image(tmp.path(), &name);
        records.push(LandmarkRecord {
            image: name.into(),
            landmarks: vec![[20.0, 10.0], [0.0, 0.0]],
        });
    }
    let samples = config(write_manifest(tmp.path(), records)).load().unwrap();
    assert_eq!(samples.len(), 3);

    let sample = &samples[0];
    assert_eq!(sample.image_shape, [3, 16, 16]);
    assert_eq!(sample.heatmap_shape, [2, 4, 4]);
    assert_eq!(sample.image_chw.len(), 3 * 16 * 16);
    assert!(sample.image_chw.iter().all(|v| (0.0..=1.0).contains(v)));

    // (20, 10) in a 40x20 image lands on heatmap cell (2, 2).
    let first = &sample.heatmaps_chw[..16];
    let peak = first
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(peak, 2 * 4 + 2);
    assert!((sample.heatmaps_chw[16] - 1.0).abs() < 1e-6);
}

#[test]
fn landmark_count_must_match_classes() {
    let tmp = tempfile::tempdir().unwrap();
    write_image(tmp.path(), "a.png");
    let manifest = write_manifest(
        tmp.path(),
        vec![LandmarkRecord {
            image: "a.png".into(),
            landmarks: vec![[1.0, 1.0]],
        }],
    );
    assert!(matches!(
        config(manifest).load(),
        Err(TrainError::Dataset(_))
    ));
}

#[test]
fn missing_files_are_reported_with_their_path() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(
        tmp.path(),
        vec![LandmarkRecord {
            image: "missing.png".into(),
            landmarks: vec![[1.0, 1.0], [2.0, 2.0]],
        }],
    );
    match config(manifest).load() {
        Err(TrainError::Image { path, .. }) => assert!(path.ends_with("missing.png")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        config(tmp.path().join("nope.json")).load(),
        Err(TrainError::Io { .. })
    ));
}
