//! Learning-rate control: a linear warmup handing over to reduce-on-plateau.

use crate::error::{TrainError, TrainResult};

/// Per-epoch learning-rate policy driven by the validation metric.
pub trait RateSchedule {
    /// Active rate for each parameter group.
    fn rates(&self) -> &[f64];

    /// Called once at the end of every epoch. Returns the `(group, rate)` pairs
    /// reported for this step; empty when no rate moved.
    fn step(&mut self, metric: Option<f64>) -> TrainResult<Vec<(usize, f64)>>;

    /// Rate of the first parameter group.
    fn rate(&self) -> f64 {
        self.rates().first().copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Plateau,
}

#[derive(Debug, Clone)]
pub struct PlateauConfig {
    pub patience: usize,
    pub factor: f64,
    /// Relative improvement a metric must show to count as better.
    pub threshold: f64,
    pub cooldown: usize,
    pub min_rate: f64,
    pub eps: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            patience: 3,
            factor: 0.1,
            threshold: 1e-4,
            cooldown: 0,
            min_rate: 0.0,
            eps: 1e-8,
        }
    }
}

impl PlateauConfig {
    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    fn validate(&self) -> TrainResult<()> {
        if self.patience == 0 {
            return Err(TrainError::Config("plateau patience must be at least 1".into()));
        }
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(TrainError::Config(format!(
                "plateau factor {} must lie in (0, 1)",
                self.factor
            )));
        }
        Ok(())
    }
}

/// Lowers every rate by `factor` once the metric has failed to improve for
/// `patience` consecutive observations ("min" mode, relative threshold).
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    cfg: PlateauConfig,
    rates: Vec<f64>,
    best: f64,
    bad_epochs: usize,
    cooldown_left: usize,
    epoch: usize,
}

impl ReduceOnPlateau {
    pub fn new(rates: Vec<f64>, cfg: PlateauConfig) -> TrainResult<Self> {
        cfg.validate()?;
        check_rates(&rates)?;
        Ok(Self {
            cfg,
            rates,
            best: f64::INFINITY,
            bad_epochs: 0,
            cooldown_left: 0,
            epoch: 0,
        })
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn bad_epochs(&self) -> usize {
        self.bad_epochs
    }

    fn is_better(&self, metric: f64) -> bool {
        metric < self.best * (1.0 - self.cfg.threshold)
    }

    /// Records one metric; returns true when the rates were lowered.
    pub fn observe(&mut self, metric: f64) -> bool {
        self.epoch += 1;
        if self.is_better(metric) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.bad_epochs = 0;
        }

        if self.bad_epochs < self.cfg.patience {
            return false;
        }
        let mut reduced = false;
        for rate in &mut self.rates {
            let next = (*rate * self.cfg.factor).max(self.cfg.min_rate);
            if *rate - next > self.cfg.eps {
                *rate = next;
                reduced = true;
            }
        }
        self.cooldown_left = self.cfg.cooldown;
        self.bad_epochs = 0;
        reduced
    }
}

impl RateSchedule for ReduceOnPlateau {
    fn rates(&self) -> &[f64] {
        &self.rates
    }

    fn step(&mut self, metric: Option<f64>) -> TrainResult<Vec<(usize, f64)>> {
        let metric = metric.ok_or(TrainError::MissingMetric {
            epoch: self.epoch + 1,
            warmup: 0,
        })?;
        let before = self.rates.clone();
        self.observe(metric);
        Ok(log_changes(self.epoch, &before, &self.rates))
    }
}

/// Linear warmup over `warmup` epochs, then [`ReduceOnPlateau`].
///
/// Epoch counting starts at 1 on the first `step`. While `epoch < warmup` the rate
/// of group `g` is `base[g] * epoch / warmup` and no metric is needed. From then on
/// every `step` must carry a metric, which the plateau controller consumes.
#[derive(Debug, Clone)]
pub struct WarmupPlateau {
    epoch: usize,
    warmup: usize,
    base_rates: Vec<f64>,
    ramp: Vec<f64>,
    plateau: ReduceOnPlateau,
}

impl WarmupPlateau {
    pub fn new(base_rates: Vec<f64>, warmup: usize, plateau: PlateauConfig) -> TrainResult<Self> {
        check_rates(&base_rates)?;
        // Before the first step the optimizer already trains at the first ramp value.
        let ramp = if warmup > 0 {
            base_rates.iter().map(|b| b / warmup as f64).collect()
        } else {
            base_rates.clone()
        };
        Ok(Self {
            epoch: 0,
            warmup,
            plateau: ReduceOnPlateau::new(base_rates.clone(), plateau)?,
            base_rates,
            ramp,
        })
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn warmup(&self) -> usize {
        self.warmup
    }

    pub fn base_rates(&self) -> &[f64] {
        &self.base_rates
    }

    pub fn phase(&self) -> Phase {
        if self.epoch < self.warmup {
            Phase::Warmup
        } else {
            Phase::Plateau
        }
    }

    pub fn plateau(&self) -> &ReduceOnPlateau {
        &self.plateau
    }
}

impl RateSchedule for WarmupPlateau {
    fn rates(&self) -> &[f64] {
        match self.phase() {
            Phase::Warmup => &self.ramp,
            Phase::Plateau => self.plateau.rates(),
        }
    }

    fn step(&mut self, metric: Option<f64>) -> TrainResult<Vec<(usize, f64)>> {
        let next = self.epoch + 1;
        let before = self.rates().to_vec();
        if next < self.warmup {
            self.epoch = next;
            let progress = next as f64 / self.warmup as f64;
            self.ramp = self.base_rates.iter().map(|b| b * progress).collect();
        } else {
            let metric = metric.ok_or(TrainError::MissingMetric {
                epoch: next,
                warmup: self.warmup,
            })?;
            self.epoch = next;
            self.plateau.observe(metric);
        }
        Ok(log_changes(self.epoch, &before, self.rates()))
    }
}

fn check_rates(rates: &[f64]) -> TrainResult<()> {
    if rates.is_empty() {
        return Err(TrainError::Config(
            "at least one parameter group rate is required".into(),
        ));
    }
    if let Some(bad) = rates.iter().find(|r| !r.is_finite() || **r <= 0.0) {
        return Err(TrainError::Config(format!(
            "learning rate {bad} must be positive"
        )));
    }
    Ok(())
}

/// One info line per parameter group when any rate moved.
fn log_changes(epoch: usize, before: &[f64], after: &[f64]) -> Vec<(usize, f64)> {
    if before == after {
        return Vec::new();
    }
    after
        .iter()
        .copied()
        .enumerate()
        .inspect(|(group, rate)| {
            tracing::info!(
                "Epoch {epoch:4}: adjusting learning rate of group {group} to {rate:.4e}"
            );
        })
        .collect()
}
