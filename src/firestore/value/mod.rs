mod array_value;
mod bytes_value;
mod map_value;
mod ordering;
pub mod server_timestamp;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use ordering::{compare_values, type_order, values_equal, TypeOrder};
pub use value::{FirestoreValue, SentinelValue, ValueKind};
