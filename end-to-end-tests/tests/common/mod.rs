// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for tests that drive the verifier against the simulator

use sno_e2e_tests::config::RunConfig;
use sno_e2e_tests::helpers::ctx::Context;
use sno_e2e_tests::sim::SimCluster;
use sno_test_utils::dev::test_setup_log;
use sno_test_utils::dev::LogContext;
use std::sync::Arc;
use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(60);
pub const RENDER_TIMEOUT: Duration = Duration::from_secs(30);

/// A run configuration with waits short enough for tests
pub fn test_config() -> RunConfig {
    RunConfig {
        poll_interval: POLL_INTERVAL,
        convergence_timeout: CONVERGENCE_TIMEOUT,
        render_timeout: RENDER_TIMEOUT,
        ..RunConfig::default()
    }
}

pub struct SimTestContext {
    pub logctx: LogContext,
    pub sim: Arc<SimCluster>,
    pub ctx: Context,
    /// rendered configuration the pool starts out on
    pub initial: String,
}

impl SimTestContext {
    pub async fn new(test_name: &str) -> SimTestContext {
        SimTestContext::with_config(test_name, test_config()).await
    }

    pub async fn with_config(
        test_name: &str,
        config: RunConfig,
    ) -> SimTestContext {
        let logctx = test_setup_log(test_name);
        let sim = Context::sim_cluster(&logctx.log, &config);
        let ctx = Context::sim(&logctx.log, config, sim.clone());
        let initial = sim.pool_current().await;
        SimTestContext { logctx, sim, ctx, initial }
    }

    /// Check that the run left nothing behind: no configuration changes,
    /// and the pool and node back where they started.
    pub async fn assert_clean(&self) {
        assert_eq!(self.sim.config_names().await, Vec::<String>::new());
        assert_eq!(self.sim.pool_current().await, self.initial);
        assert!(self.sim.node_annotations().await.is_converged(&self.initial));
    }

    pub fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }
}
