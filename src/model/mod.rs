// src/model/mod.rs
//! Poisson/log regression: design matrices, IRLS GLM, random-intercept
//! GLMM and derived effects.

pub mod design;
pub mod effects;
pub mod family;
pub mod glm;
pub mod glmm;
pub mod linalg;

pub use design::{DesignMatrix, GroupIndex, INTERCEPT};
pub use effects::{
    fitted_at, group_effects, group_effects_table, low_high, rate_ratio, GroupEffectRow, RateRatio,
};
pub use family::Family;
pub use glm::{Coefficient, FittedModel, GlmFit, GlmSolver, IrlsControl};
pub use glmm::{GlmmControl, GlmmFit, GlmmSolver, GroupEffect};
