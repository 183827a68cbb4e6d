//! Shorthands for building and returning [`crate::error::StreamError`] values.

/// Creates a [`crate::error::StreamError`] from a kind and a static description.
///
/// An optional detail may follow, either as `detail = value` for anything convertible into a
/// `Cow<'static, str>` or as a plain expression rendered with `to_string()`. A `source:` may be
/// attached in both forms.
#[macro_export]
macro_rules! stream_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::StreamError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::StreamError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::StreamError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        $crate::error::StreamError::from(($kind, $desc, $detail)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::StreamError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with a [`crate::error::StreamError`] built by [`stream_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::stream_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        return ::core::result::Result::Err($crate::stream_error!($kind, $desc, detail = $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::stream_error!($kind, $desc, $detail))
    };
}
