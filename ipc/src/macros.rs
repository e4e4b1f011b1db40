/// Ensures at compile time that a type is `Send` and `Sync`.
///
/// ```text
/// pub struct MyStruct {}
/// assert_send_and_sync!(MyStruct);
/// ```
macro_rules! assert_send_and_sync {
    ( $x:ty ) => {
        const _: fn() = || {
            fn assert_send_and_sync<T: Send + Sync>() {}
            assert_send_and_sync::<$x>();
        };
    };
}
