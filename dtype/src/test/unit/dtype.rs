use proptest::prelude::*;
use test_case::test_case;

use crate::*;

#[test_case(DType::Bool, 1)]
#[test_case(DType::Int32, 4)]
#[test_case(DType::Float16, 2)]
#[test_case(DType::Float64, 8)]
#[test_case(DType::image(ImageKind::Half, 4, 4), 2)]
#[test_case(DType::image(ImageKind::Float, 4, 4), 4)]
fn test_itemsize(dtype: DType, expected: usize) {
    assert_eq!(dtype.itemsize(), expected);
}

#[test]
fn test_image_computes_in_float32() {
    let img = DType::image(ImageKind::Half, 2, 8);
    assert!(img.is_image());
    assert!(img.is_float());
    assert_eq!(img.base(), ScalarDType::Float32);
    assert_eq!(img.scalar(), None);
    assert_eq!(img.to_string(), "imageh(2, 8)");
}

#[test]
fn test_display_uses_c_names() {
    assert_eq!(DType::Float32.to_string(), "float");
    assert_eq!(DType::UInt8.to_string(), "uchar");
}

#[test]
fn test_bool_elements() {
    let bytes = bool::to_bytes(&[true, false, true]);
    assert_eq!(bytes, vec![1, 0, 1]);
    assert_eq!(bool::from_bytes(&bytes), vec![true, false, true]);
}

proptest! {
    #[test]
    fn f32_bytes_roundtrip(values in prop::collection::vec(any::<f32>(), 0..64)) {
        let bytes = f32::to_bytes(&values);
        prop_assert_eq!(bytes.len(), values.len() * 4);
        let back = f32::from_bytes(&bytes);
        prop_assert_eq!(back.len(), values.len());
        for (a, b) in values.iter().zip(back.iter()) {
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }
}
