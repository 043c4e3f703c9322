//! Small helpers shared by the decoder and the sockets.

/// Returns early with `$error` unless `$predicate` holds.
///
/// ```ignore
/// ensure!(content_length <= max_body_size, ParseError::too_large_body(content_length, max_body_size));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
