// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::compact::{CompactStruct, CompactWriter};
use super::AgentIdentity;
use crate::aggregator::MetricAggregate;
use crate::error::EncodeError;

/// One aggregated custom metric for a harvest.
#[derive(Debug)]
pub struct CustomMetric<'a> {
    pub agent: &'a AgentIdentity,
    /// Epoch millis of the harvest.
    pub timestamp: i64,
    pub name: &'a str,
    pub aggregate: MetricAggregate,
}

impl CompactStruct for CustomMetric<'_> {
    fn write_fields(&self, w: &mut CompactWriter) -> Result<(), EncodeError> {
        w.field_string(1, &self.agent.agent_id)?;
        w.field_string(2, &self.agent.app_name)?;
        w.field_i64(3, self.agent.agent_start_time);
        w.field_i64(4, self.timestamp);
        w.field_string(5, self.name)?;
        w.field_i64(6, self.aggregate.count);
        w.field_double(7, "sum", self.aggregate.sum)?;
        w.field_double(8, "min", self.aggregate.min)?;
        w.field_double(9, "max", self.aggregate.max)
    }
}
