//! The thin command layer over the two core entry points.

pub mod hiber;
pub mod hivescan;
pub mod ident;
