pub mod flux_declip;
