// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

//! Metric specification and registration helpers for the fast-path stack's per-worker counters.

mod register;
mod spec;

pub use register::*;
pub use spec::*;

use metrics::Unit;

/// Names of the counters a [`crate::Register`] caller registers once per worker at startup.
///
/// These mirror the `app_write_cnt`/`app_write_drop`/`write_lwip_drop`/`read_lwip_drop`/`app_read_cnt`
/// counters of the original send/receive paths.
pub mod names {
    pub const APP_WRITE_CNT: &str = "fastpath_app_write_total";
    pub const APP_WRITE_DROP: &str = "fastpath_app_write_drop_total";
    pub const APP_WRITE_IDLEFAIL: &str = "fastpath_app_write_idlefail_total";
    pub const WRITE_DROP: &str = "fastpath_write_drop_total";
    pub const APP_READ_CNT: &str = "fastpath_app_read_total";
    pub const READ_DROP: &str = "fastpath_read_drop_total";
}

/// Build the [`MetricSpec`]s for one worker's counters, tagged with its worker index.
#[must_use]
pub fn worker_metric_specs(worker: u16) -> Vec<MetricSpec> {
    let labels = map![ "worker" => worker.to_string() ];
    vec![
        MetricSpec::new(names::APP_WRITE_CNT, Unit::Count, labels.clone()),
        MetricSpec::new(names::APP_WRITE_DROP, Unit::Count, labels.clone()),
        MetricSpec::new(names::APP_WRITE_IDLEFAIL, Unit::Count, labels.clone()),
        MetricSpec::new(names::WRITE_DROP, Unit::Count, labels.clone()),
        MetricSpec::new(names::APP_READ_CNT, Unit::Count, labels.clone()),
        MetricSpec::new(names::READ_DROP, Unit::Count, labels),
    ]
}
