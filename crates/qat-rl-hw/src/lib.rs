//! Silicon model for the QAT gen4 rate-limiting (RL) block.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the RL hardware and firmware contract: CSR offsets, the
//! numeric constants the token translation is built on, the tree-id
//! encoding, the admin message layout and the PF↔VF rate-query framing.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | RL link tables, bucket granularity and admin mailbox CSRs |
//! | [`gen4`] | gen4 RL constants (scan rate, PCIe scale, throughput references) |
//! | [`tree`] | Root/cluster/leaf id space and ring numbering |
//! | [`ring`] | Ring-to-service CSR encoding |
//! | [`admin`] | Firmware admin request/response and SLA parameter layout |
//! | [`pfvf`] | VF→PF CIR/PIR request and PF→VF response framing |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admin;
pub mod gen4;
pub mod pfvf;
pub mod regs;
pub mod ring;
pub mod tree;
