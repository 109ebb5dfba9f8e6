//! An experimental library for verifying CIL method bodies ahead of
//! execution, per the ECMA-335 verification rules.
//!
//! The entry point is [`verify`]: given a method handle, a [`typesystem::TypeSystem`]
//! oracle answering reflective questions from metadata, and a
//! [`typesystem::BytecodeSource`] yielding the raw body, it proves that no
//! well-typed execution of the method can corrupt memory, break type safety
//! or violate the structural constraints of the bytecode. Verification is a
//! pure function of the method identity; it never executes or rewrites code.

pub mod errors;
pub mod il;
pub mod lattice;
pub mod metadata_token;
pub mod regions;
pub mod stack;
pub mod typesystem;
pub mod verifier;

mod blocks;
mod utilities;

pub use errors::{ErrorArgument, ErrorKind, ReportPolicy, VerificationFailure, VerifyError};
pub use verifier::{verify, VerifierOptions};
