//! Input/Output for count data, per-id vectors, results and frozen parameters

mod csv;
mod frozen;

pub use self::csv::{align_to_ids, read_count_matrix, read_named_vector, write_matrix};
pub use frozen::{load_frozen_params, save_frozen_params};
