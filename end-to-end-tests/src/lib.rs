// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Verifies that a declarative node-configuration rollout converges on a
//! single-node pool, and that removing the change rolls the node back.
//!
//! The pieces, leaves first:
//!
//! * [`sno_test_utils::dev::poll`]: the bounded polling loop everything else
//!   waits with
//! * [`pool`]: reads rendered-configuration identifiers and node annotations
//! * [`convergence`]: waits for the pool and its node to reach a target
//! * [`facts`]: runs read-only commands on the node and checks their output
//! * [`scenario`]: drives submit, converge, verify, delete, converge back,
//!   verify again
//!
//! The control plane itself is reached through the traits in [`cluster`],
//! backed either by a real cluster ([`cluster::kube`]) or by the in-process
//! simulator in [`sim`].

pub mod audit;
pub mod cluster;
pub mod config;
pub mod convergence;
pub mod error;
pub mod facts;
pub mod helpers;
pub mod pool;
pub mod scenario;
pub mod sim;
