//! Peridem is a distributed simulator for granular assemblies of rigid
//! ellipsoidal particles (the discrete element method), optionally coupled
//! to a peridynamic body through breakable particle-point bonds.
//!
//! The domain is split into a rectilinear grid of patches, one per rank.
//! Each rank integrates the particles it owns, receives read-only ghost
//! copies of its neighbors' particles near the patch faces for contact
//! detection, and hands particles over to a neighbor when they cross a
//! patch boundary. Ranks talk only through the `Communicator` trait in
//! `message`, so the same code runs over in-process channels or TCP.

pub mod bond;
pub mod boundary;
pub mod command;
pub mod config;
pub mod contact;
pub mod error;
pub mod geometry;
pub mod integrate;
pub mod message;
pub mod neighbor;
pub mod particle;
pub mod patch;
pub mod simulation;
pub mod snapshot;
pub mod topology;
