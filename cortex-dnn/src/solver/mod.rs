use cortex_core::{Blob, Error, Result};
use ndarray::Zip;
use rayon::iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator};

use crate::layer::Param;


/// Turns accumulated parameter gradients into parameter updates.
///
/// Implementations must leave every gradient cleared.
pub trait Solver {
    fn train(&mut self, params: &mut [Param<'_>]) -> Result<()>;
}

/// Gradient descent with momentum and L2 weight decay.
///
/// ```text
/// v(t+1) = μ * v(t) + g(t+1) + λ * p(t)
/// p(t+1) = p(t) - lr * v(t+1)
/// ```
#[derive(Clone, Debug)]
pub struct SimpleGradientSolver {
    learning_rate: f32,
    momentum: f32,
    l2_decay: f32,
    velocities: Vec<Blob>,
}

impl SimpleGradientSolver {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.,
            l2_decay: 0.,
            velocities: Vec::new(),
        }
    }

    /// Sets the momentum factor, which must lie in `[0, 1)`.
    pub fn with_momentum(mut self, momentum: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&momentum) {
            return Err(Error::Configuration(format!(
                "momentum must lie in [0, 1), got {}",
                momentum
            )));
        }
        self.momentum = momentum;
        Ok(self)
    }

    pub fn with_l2_decay(mut self, l2_decay: f32) -> Result<Self> {
        if l2_decay < 0. {
            return Err(Error::Configuration(format!(
                "weight decay must not be negative, got {}",
                l2_decay
            )));
        }
        self.l2_decay = l2_decay;
        Ok(self)
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn l2_decay(&self) -> f32 {
        self.l2_decay
    }

    /// Forgets the momentum history.
    pub fn reset(&mut self) {
        self.velocities.clear();
    }
}

impl Solver for SimpleGradientSolver {
    fn train(&mut self, params: &mut [Param<'_>]) -> Result<()> {
        let stale = self.velocities.len() != params.len()
            || self
                .velocities
                .iter()
                .zip(params.iter())
                .any(|(velocity, param)| velocity.desc() != param.value.desc());
        if stale {
            log::debug!("solver tracks {} parameter blobs", params.len());
            self.velocities = params
                .iter()
                .map(|param| Blob::zeros(param.value.desc()))
                .collect();
        }

        let (lr, momentum, decay) = (self.learning_rate, self.momentum, self.l2_decay);
        params
            .par_iter_mut()
            .zip(self.velocities.par_iter_mut())
            .for_each(|(param, velocity)| {
                Zip::from(param.value.data_mut())
                    .and(param.diff.data())
                    .and(velocity.data_mut())
                    .for_each(|w, &g, v| {
                        *v = momentum * *v + g + decay * *w;
                        *w -= lr * *v;
                    });
                param.diff.data_mut().fill(0.);
            });
        Ok(())
    }
}
