//! FreeSWITCH integration for Accurate
//!
//! Turns the JSON CDRs posted by `mod_json_cdr` into raw [`Cdr`] records
//! ready for the mediation pipeline.
//!
//! ```text
//! FreeSWITCH mod_json_cdr
//!         |
//!         v
//!  POST /freeswitch_json
//!         |
//!         v
//!   FsCdr (parser) -> Cdr -> CDR worker pool
//! ```
//!
//! [`Cdr`]: accurate_core::models::Cdr

pub mod event;

pub use event::{FsCdr, FS_CDR_SOURCE};
