pub mod calamine_reader;
pub mod scored_output_adapter;
