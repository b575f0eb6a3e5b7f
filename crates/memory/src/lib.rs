//! Physical address routing for memory-mapped device windows.
//!
//! [`MmioBus`] owns every registered [`MmioHandler`] and forwards each guest load/store to the
//! handler whose window contains the address, after checking the access against the handler's
//! declared [`AccessConstraints`]. Rejected and unmapped accesses never fault: they are reported
//! as guest errors and answered with a default value.

#![forbid(unsafe_code)]

pub mod bus;

pub use bus::{AccessConstraints, MapError, MmioBus, MmioHandler};
