// Pipeline processing: aggregation into the canonical table and anomaly scoring

pub mod aggregate;
pub mod scoring;
