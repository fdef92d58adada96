pub mod build_metrics_use_case;
pub mod ports;
pub mod score_metrics_use_case;
