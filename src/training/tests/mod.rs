//! Test suite for the staged training infrastructure
//!
//! Unit tests live next to the code they cover. The tests here drive several
//! components together through a toy network that trains in milliseconds:
//! phase transitions, epoch atomicity, checkpoint/resume and loss
//! aggregation.

// Test modules
pub mod checkpoint_tests;
pub mod phase_tests;

// Shared fixtures
pub mod fixtures;
