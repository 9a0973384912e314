// src/schema/arrow.rs

use arrow::datatypes::DataType;

use super::types::NumericType;

/// Map a declared numeric type onto its Arrow DataType.
pub fn map_to_arrow_type(ty: NumericType) -> DataType {
    match ty {
        NumericType::Float64 => DataType::Float64,
        NumericType::Int64 => DataType::Int64,
    }
}

/// True for the key types the join engine accepts.
pub fn is_key_type(dt: &DataType) -> bool {
    matches!(dt, DataType::Int64 | DataType::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_declared_types() {
        assert_eq!(map_to_arrow_type(NumericType::Int64), DataType::Int64);
        assert_eq!(map_to_arrow_type(NumericType::Float64), DataType::Float64);
        assert!(is_key_type(&DataType::Utf8));
        assert!(!is_key_type(&DataType::Float64));
    }
}
