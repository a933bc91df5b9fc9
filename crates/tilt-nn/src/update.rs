// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{FeatureError, FeatureResult};
use serde::{Deserialize, Serialize};

/// Hard stability bound applied to every weight coordinate after every
/// update step.
pub const WEIGHT_CLIP: f32 = 1e5;

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

/// Stochastic-approximation rule applied to the dual weights.
///
/// The measured feature deviation plays the role of the stochastic gradient
/// of the dual objective; the caller supplies the step magnitude per call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum UpdateRule {
    /// Plain gradient step, optionally with heavy-ball momentum.
    Sgd {
        #[serde(default)]
        momentum: f32,
    },
    /// Adaptive first/second-moment rule with bias correction.
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
}

impl Default for UpdateRule {
    fn default() -> Self {
        UpdateRule::Sgd { momentum: 0.0 }
    }
}

impl UpdateRule {
    /// Rejects parameterizations that would destabilize the recursion.
    pub fn validate(&self) -> FeatureResult<()> {
        match *self {
            UpdateRule::Sgd { momentum } => {
                if !momentum.is_finite() || !(0.0..1.0).contains(&momentum) {
                    return Err(FeatureError::InvalidArgument {
                        feature: "update_rule",
                        name: "momentum",
                        reason: format!("must lie in [0, 1), got {momentum}"),
                    });
                }
            }
            UpdateRule::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                for (name, value) in [("beta1", beta1), ("beta2", beta2)] {
                    if !value.is_finite() || !(0.0..1.0).contains(&value) {
                        return Err(FeatureError::InvalidArgument {
                            feature: "update_rule",
                            name,
                            reason: format!("must lie in [0, 1), got {value}"),
                        });
                    }
                }
                if !epsilon.is_finite() || epsilon <= 0.0 {
                    return Err(FeatureError::InvalidArgument {
                        feature: "update_rule",
                        name: "epsilon",
                        reason: format!("must be positive, got {epsilon}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Per-group accumulator buffers owned alongside the weights.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RuleState {
    Sgd {
        velocity: Vec<Vec<f32>>,
    },
    Adam {
        mean: Vec<Vec<f32>>,
        variance: Vec<Vec<f32>>,
        step: u64,
    },
}

fn zeroed(widths: &[usize]) -> Vec<Vec<f32>> {
    widths.iter().map(|&w| vec![0.0; w]).collect()
}

impl RuleState {
    pub(crate) fn new(rule: &UpdateRule, widths: &[usize]) -> Self {
        match rule {
            UpdateRule::Sgd { .. } => RuleState::Sgd {
                velocity: zeroed(widths),
            },
            UpdateRule::Adam { .. } => RuleState::Adam {
                mean: zeroed(widths),
                variance: zeroed(widths),
                step: 0,
            },
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            RuleState::Sgd { velocity } => {
                for group in velocity.iter_mut() {
                    group.iter_mut().for_each(|v| *v = 0.0);
                }
            }
            RuleState::Adam {
                mean,
                variance,
                step,
            } => {
                *step = 0;
                for group in mean.iter_mut().chain(variance.iter_mut()) {
                    group.iter_mut().for_each(|v| *v = 0.0);
                }
            }
        }
    }

    /// Applies one step of `rule` to `weights` using the per-group gradient
    /// estimates, then clips every coordinate into the stability box.
    pub(crate) fn apply(
        &mut self,
        rule: &UpdateRule,
        weights: &mut [Vec<f32>],
        gradients: &[Vec<f32>],
        learning_rate: f32,
    ) {
        match (self, rule) {
            (RuleState::Sgd { velocity }, UpdateRule::Sgd { momentum }) => {
                for ((w, v), g) in weights
                    .iter_mut()
                    .zip(velocity.iter_mut())
                    .zip(gradients.iter())
                {
                    for ((wc, vc), &gc) in w.iter_mut().zip(v.iter_mut()).zip(g.iter()) {
                        *vc = momentum * *vc + gc;
                        *wc += learning_rate * *vc;
                    }
                }
            }
            (
                RuleState::Adam {
                    mean,
                    variance,
                    step,
                },
                UpdateRule::Adam {
                    beta1,
                    beta2,
                    epsilon,
                },
            ) => {
                *step += 1;
                let bias1 = 1.0 - beta1.powi(*step as i32);
                let bias2 = 1.0 - beta2.powi(*step as i32);
                for ((w, (m, v)), g) in weights
                    .iter_mut()
                    .zip(mean.iter_mut().zip(variance.iter_mut()))
                    .zip(gradients.iter())
                {
                    for ((wc, (mc, vc)), &gc) in
                        w.iter_mut().zip(m.iter_mut().zip(v.iter_mut())).zip(g.iter())
                    {
                        *mc = beta1 * *mc + (1.0 - beta1) * gc;
                        *vc = beta2 * *vc + (1.0 - beta2) * gc * gc;
                        let m_hat = *mc / bias1;
                        let v_hat = *vc / bias2;
                        *wc += learning_rate * m_hat / (v_hat.sqrt() + epsilon);
                    }
                }
            }
            // State is built from the rule at construction and reset in
            // lockstep, so the arms cannot disagree.
            _ => unreachable!("update-rule state drifted from its rule"),
        }
        for group in weights.iter_mut() {
            for wc in group.iter_mut() {
                *wc = wc.clamp(-WEIGHT_CLIP, WEIGHT_CLIP);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_sgd_steps_along_gradient() {
        let rule = UpdateRule::default();
        let mut state = RuleState::new(&rule, &[2]);
        let mut weights = vec![vec![0.0, 0.0]];
        state.apply(&rule, &mut weights, &[vec![1.0, -2.0]], 0.1);
        assert!((weights[0][0] - 0.1).abs() < 1e-6);
        assert!((weights[0][1] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let rule = UpdateRule::Sgd { momentum: 0.5 };
        let mut state = RuleState::new(&rule, &[1]);
        let mut weights = vec![vec![0.0]];
        state.apply(&rule, &mut weights, &[vec![1.0]], 1.0);
        state.apply(&rule, &mut weights, &[vec![1.0]], 1.0);
        // v1 = 1, v2 = 1.5; w = 1 + 1.5
        assert!((weights[0][0] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_is_learning_rate_sized() {
        let rule = UpdateRule::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        };
        let mut state = RuleState::new(&rule, &[1]);
        for magnitude in [1e-3f32, 1.0, 1e3] {
            let mut weights = vec![vec![0.0]];
            state.reset();
            state.apply(&rule, &mut weights, &[vec![magnitude]], 0.05);
            assert!(
                (weights[0][0] - 0.05).abs() < 1e-3,
                "magnitude {magnitude} produced {}",
                weights[0][0]
            );
        }
    }

    #[test]
    fn weights_are_clipped_into_stability_box() {
        let rule = UpdateRule::default();
        let mut state = RuleState::new(&rule, &[2]);
        let mut weights = vec![vec![0.0, 0.0]];
        state.apply(&rule, &mut weights, &[vec![1e12, -1e12]], 1.0);
        assert_eq!(weights[0], vec![WEIGHT_CLIP, -WEIGHT_CLIP]);
    }

    #[test]
    fn rule_validation_rejects_bad_parameters() {
        assert!(UpdateRule::Sgd { momentum: 1.0 }.validate().is_err());
        assert!(UpdateRule::Sgd { momentum: -0.1 }.validate().is_err());
        assert!(UpdateRule::Adam {
            beta1: 0.9,
            beta2: 1.0,
            epsilon: 1e-8
        }
        .validate()
        .is_err());
        assert!(UpdateRule::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 0.0
        }
        .validate()
        .is_err());
        assert!(UpdateRule::default().validate().is_ok());
    }

    #[test]
    fn rule_parses_from_json_with_defaults() {
        let rule: UpdateRule = serde_json::from_str(r#"{"name": "sgd"}"#).unwrap();
        assert_eq!(rule, UpdateRule::Sgd { momentum: 0.0 });
        let rule: UpdateRule = serde_json::from_str(r#"{"name": "adam"}"#).unwrap();
        assert_eq!(
            rule,
            UpdateRule::Adam {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8
            }
        );
    }
}
