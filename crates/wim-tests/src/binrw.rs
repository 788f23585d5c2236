//! Test utilities for binrw-related code.

/// Generates a pair of tests asserting that a binrw value writes to the
/// given little-endian bytes and reads back from them.
///
/// ```ignore
/// test_binrw_case! {
///     my_case: StructName {
///         field1: value1,
///         field2: value2,
///     } <=> [byte1, byte2, byte3, ...]
/// }
/// ```
#[macro_export]
macro_rules! test_binrw_case {
    (
        $case:ident: $name:ident {
            $(
                $field:ident : $value:expr,
            )+
        } <=> [$($bytes:expr),* $(,)?]
    ) => {
        pastey::paste! {
            #[test]
            fn [<test_ $case _write>]() {
                use ::binrw::{prelude::*, io::Cursor};
                let value = $name {
                    $($field: $value),*
                };
                let mut writer = Cursor::new(Vec::new());
                value.write_le(&mut writer).unwrap();
                let expected: Vec<u8> = vec![$($bytes),*];
                assert_eq!(writer.into_inner(), expected);
            }

            #[test]
            fn [<test_ $case _read>]() {
                use ::binrw::{prelude::*, io::Cursor};
                let bytes: &'static [u8] = &[$($bytes),*];
                let mut reader = Cursor::new(bytes);
                let value: $name = $name::read_le(&mut reader).unwrap();
                let expected = $name {
                    $($field: $value),*
                };
                assert_eq!(value, expected);
            }
        }
    };
}
