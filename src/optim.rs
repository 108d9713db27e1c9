use ndarray::Zip;

use crate::config::OptimConfig;
use crate::model::Parameters;

/// Learning rate with linear warmup followed by linear decay.
///
/// The rate grows linearly to `learning_rate` over `warmup_steps` and
/// then decays linearly to zero at `num_train_steps`.
#[derive(Clone, Copy, Debug)]
pub struct LrSchedule {
    learning_rate: f32,
    warmup_steps: usize,
    num_train_steps: usize,
}

impl LrSchedule {
    pub fn new(config: &OptimConfig) -> Self {
        LrSchedule {
            learning_rate: config.learning_rate,
            warmup_steps: config.warmup_steps,
            num_train_steps: config.num_train_steps,
        }
    }

    /// Learning rate of the (1-based) optimizer step.
    pub fn lr(&self, step: usize) -> f32 {
        let step = step as f32;
        let warmup = self.warmup_steps as f32;
        let total = self.num_train_steps as f32;

        let factor = if step < warmup {
            step / warmup
        } else if total > warmup {
            ((total - step) / (total - warmup)).max(0.)
        } else {
            1.
        };

        self.learning_rate * factor
    }
}

/// Scale gradients so that their global l2 norm does not exceed
/// `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut Parameters, max_norm: f32) -> f32 {
    let norm = grads.l2_norm();
    if norm > max_norm {
        grads.scale(max_norm / (norm + 1e-6));
    }
    norm
}

/// Adam with decoupled weight decay.
///
/// Biases and the gate are not decayed.
pub struct Adam {
    betas: [f32; 2],
    eps: f32,
    weight_decay: f32,
    first_moment: Parameters,
    second_moment: Parameters,
    n_steps: i32,
}

impl Adam {
    pub fn new(config: &OptimConfig, params: &Parameters) -> Self {
        Adam {
            betas: config.betas,
            eps: 1e-6,
            weight_decay: config.weight_decay,
            first_moment: params.zeros_like(),
            second_moment: params.zeros_like(),
            n_steps: 0,
        }
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps as usize
    }

    /// Apply one update with learning rate `lr`.
    pub fn step(&mut self, params: &mut Parameters, grads: &Parameters, lr: f32) {
        self.n_steps += 1;
        let [beta1, beta2] = self.betas;
        let bias_correction1 = 1. - beta1.powi(self.n_steps);
        let bias_correction2 = 1. - beta2.powi(self.n_steps);
        let step_size = lr * bias_correction2.sqrt() / bias_correction1;
        let eps = self.eps;
        let weight_decay = self.weight_decay;

        let tensors = params
            .tensors_mut()
            .into_iter()
            .zip(grads.tensors())
            .zip(self.first_moment.tensors_mut())
            .zip(self.second_moment.tensors_mut());
        for ((((name, mut param), (_, grad)), (_, mut m)), (_, mut v)) in tensors {
            if decays(&name) && weight_decay > 0. {
                param.mapv_inplace(|p| p * (1. - lr * weight_decay));
            }

            m.zip_mut_with(&grad, |m, &g| *m = beta1 * *m + (1. - beta1) * g);
            v.zip_mut_with(&grad, |v, &g| *v = beta2 * *v + (1. - beta2) * g * g);

            Zip::from(&mut param)
                .and(&m)
                .and(&v)
                .apply(|p, &m, &v| *p -= step_size * m / (v.sqrt() + eps));
        }
    }
}

fn decays(name: &str) -> bool {
    !(name.ends_with(".bias") || name == "gate")
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;

    use super::{clip_grad_norm, decays, Adam, LrSchedule};
    use crate::config::{HeadType, OptimConfig};
    use crate::model::Parameters;
    use crate::util::{array_all_close, close, seeded_rng};

    fn config() -> OptimConfig {
        OptimConfig {
            learning_rate: 1e-2,
            betas: [0.9, 0.999],
            weight_decay: 0.,
            warmup_steps: 10,
            num_train_steps: 110,
            grad_norm: -1.,
            gradient_accumulation_steps: 1,
        }
    }

    #[test]
    fn schedule_warms_up_and_decays() {
        let schedule = LrSchedule::new(&config());
        assert!(close(schedule.lr(0), 0., 1e-8));
        assert!(close(schedule.lr(5), 5e-3, 1e-8));
        assert!(close(schedule.lr(10), 1e-2, 1e-8));
        assert!(close(schedule.lr(60), 5e-3, 1e-8));
        assert!(close(schedule.lr(110), 0., 1e-8));
        assert!(close(schedule.lr(200), 0., 1e-8));
    }

    #[test]
    fn clipping_bounds_norm() {
        let mut rng = seeded_rng(4, 0);
        let mut grads = Parameters::new(HeadType::MaxPooling, 4, 7, &mut rng);
        let norm = grads.l2_norm();
        assert!(norm > 1.);

        assert!(close(clip_grad_norm(&mut grads, 2. * norm), norm, 1e-6));
        assert!(close(grads.l2_norm(), norm, 1e-5));

        clip_grad_norm(&mut grads, 1.);
        assert!(close(grads.l2_norm(), 1., 1e-4));
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut rng = seeded_rng(4, 0);
        let mut params = Parameters::new(HeadType::LatentIdiomGate, 4, 7, &mut rng);
        let before = params.clone();

        let mut grads = params.zeros_like();
        grads.channel1.bias = Array1::from(vec![1., -2., 0., 3.]);

        let mut adam = Adam::new(&config(), &params);
        adam.step(&mut params, &grads, 0.1);
        assert_eq!(adam.n_steps(), 1);

        // Bias-corrected moments give a step of ±lr for non-zero gradients.
        let delta = &params.channel1.bias - &before.channel1.bias;
        assert!(close(delta[0], -0.1, 1e-4));
        assert!(close(delta[1], 0.1, 1e-4));
        assert!(close(delta[2], 0., 1e-8));
        assert!(close(delta[3], -0.1, 1e-4));
        assert_eq!(params.sentiment, before.sentiment);
    }

    #[test]
    fn weight_decay_skips_biases() {
        let mut rng = seeded_rng(4, 0);
        let mut params = Parameters::new(HeadType::MaxPooling, 4, 7, &mut rng);
        let before = params.clone();
        let grads = params.zeros_like();

        let mut adam = Adam::new(
            &OptimConfig {
                weight_decay: 0.5,
                ..config()
            },
            &params,
        );
        adam.step(&mut params, &grads, 0.1);

        assert_eq!(params.channel1.bias, before.channel1.bias);
        assert!(array_all_close(
            params.channel1.weight.view(),
            (&before.channel1.weight * 0.95).view(),
            1e-7
        ));
        assert!(!decays("gate"));
        assert!(decays("idiom_embedding"));
    }
}
