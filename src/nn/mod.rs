pub mod patchnce;
pub mod utils;

pub use patchnce::{NceError, PatchNceCtx, PatchNceLoss};
pub use utils::{grad_check, l2_normalize_rows, randn_seeded, Tolerance};
