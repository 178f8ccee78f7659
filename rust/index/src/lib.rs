mod ivfpq;
mod quantizer;
mod utils;

pub use ivfpq::{load_posting_list_sizes, DistanceTable, IndexError, IvfPqIndex};
pub use quantizer::{Quantizer, QuantizerError};
pub use utils::partial_sort_by_distance;
