// Observability: pipeline counters and histograms

pub mod metrics;
