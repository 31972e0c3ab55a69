// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Roll configuration changes out to a single-node pool and back, and check
//! the node at every step

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;
use slog::info;
use sno_e2e_tests::config::RunConfig;
use sno_e2e_tests::helpers::ctx::Context;
use sno_e2e_tests::scenario::runner::error_chain;
use sno_e2e_tests::scenario::ScenarioSpec;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(
    name = "sno-e2e",
    about = "Verify configuration rollout on a single-node pool"
)]
struct Args {
    /// TOML configuration file (every setting has a default)
    #[clap(long, env = "SNO_E2E_CONFIG")]
    config: Option<PathBuf>,

    /// pool to roll changes out to
    #[clap(long)]
    pool: Option<String>,

    /// node role the pool's changes are labelled with
    #[clap(long)]
    role: Option<String>,

    /// bound on each wait, e.g. "20m"
    #[clap(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// stop waiting as soon as the node reports a degraded rollout
    #[clap(long)]
    fail_fast: bool,

    /// run only this scenario (may be repeated)
    #[clap(long = "scenario", value_name = "NAME")]
    scenarios: Vec<String>,

    /// don't check the daemon's logs for token rotation failures
    #[clap(long)]
    skip_token_audit: bool,

    /// run against an in-process simulated cluster
    #[clap(long)]
    sim: bool,

    /// list the available scenarios and exit
    #[clap(long)]
    list: bool,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RunConfig::default(),
        };
        if let Some(pool) = &self.pool {
            config.pool = pool.clone();
        }
        if let Some(role) = &self.role {
            config.role = role.clone();
        }
        if let Some(timeout) = self.timeout {
            config.convergence_timeout = timeout;
            config.render_timeout = timeout;
        }
        config.fail_fast_on_degraded |= self.fail_fast;
        Ok(config)
    }

    fn selected_scenarios(&self) -> Result<Vec<ScenarioSpec>> {
        if self.scenarios.is_empty() {
            return Ok(ScenarioSpec::builtin());
        }
        self.scenarios
            .iter()
            .map(|name| {
                ScenarioSpec::find(name).with_context(|| {
                    format!("no scenario named {:?} (see --list)", name)
                })
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list {
        for spec in ScenarioSpec::builtin() {
            println!("{}", spec.name);
        }
        return Ok(());
    }

    let config = args.run_config()?;
    let scenarios = args.selected_scenarios()?;
    let log = config.log.to_logger().context("initializing logger")?;

    let ctx = if args.sim {
        let cluster = Context::sim_cluster(&log, &config);
        Context::sim(&log, config, cluster)
    } else {
        Context::kube(&log, config)
            .await
            .context("connecting to cluster")?
    };
    info!(ctx.log, "starting run";
        "pool" => &ctx.config.pool,
        "scenarios" => scenarios.len(),
        "sim" => args.sim,
    );

    let reports = ctx.runner().run_all(&scenarios).await;
    let mut failed = 0;
    for report in &reports {
        println!("{}", report);
        if !report.passed() {
            failed += 1;
        }
    }

    let mut audit_failed = false;
    if !args.skip_token_audit {
        match ctx.audit_daemon_tokens().await {
            Ok(findings) if findings.is_empty() => {
                println!("PASS daemon-token-audit");
            }
            Ok(findings) => {
                audit_failed = true;
                println!("FAIL daemon-token-audit");
                for finding in findings {
                    println!("  {}", finding);
                }
            }
            Err(error) => {
                audit_failed = true;
                println!("FAIL daemon-token-audit\n  {}", error_chain(&error));
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, reports.len());
    }
    if audit_failed {
        bail!("daemon token audit failed");
    }
    Ok(())
}
