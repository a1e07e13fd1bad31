//! End-to-end and adversarial test suite for Strata.
//!
//! Integration tests drive a full [`Pool`](strata_pool::Pool) through the
//! loan lifecycle with in-process collaborators from [`helpers`], and check
//! accounting invariants under randomized operation sequences.

pub mod helpers;
