use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "remote_write.requests",
    metric_type: MetricType::Counter,
    description: "Inbound write requests. Tagged with method.",
};

pub const DELIVERIES: MetricDef = MetricDef {
    name: "remote_write.deliveries",
    metric_type: MetricType::Counter,
    description: "Outbound replicas by outcome. Tagged with code (status or <error>), name.",
};

pub const SUPPRESSED_ERRORS: MetricDef = MetricDef {
    name: "remote_write.suppressed_errors",
    metric_type: MetricType::Counter,
    description: "Failure log lines withheld by the error rate limiter. Tagged with name.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUESTS, DELIVERIES, SUPPRESSED_ERRORS];
