#![forbid(unsafe_code)]

pub mod rng;

pub use rng::{register_rng, RngConfig, RngGuestError, RngRegister, Stm32Rng};
