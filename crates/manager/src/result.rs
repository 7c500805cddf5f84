//! Success/failure helpers shared by every component
//!
//! Failures travel as values: `map`/`map_err` come from [`Result`] itself,
//! these extensions add the total eliminators the event consumers use.

/// Extension methods for [`Result`]
pub trait ResultExt<T, E> {
    /// Collapse both branches into a single value.
    fn fold<R>(self, on_ok: impl FnOnce(T) -> R, on_err: impl FnOnce(E) -> R) -> R;

    /// Borrowing variant of [`ResultExt::fold`].
    fn fold_ref<'a, R>(
        &'a self,
        on_ok: impl FnOnce(&'a T) -> R,
        on_err: impl FnOnce(&'a E) -> R,
    ) -> R
    where
        T: 'a,
        E: 'a;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn fold<R>(self, on_ok: impl FnOnce(T) -> R, on_err: impl FnOnce(E) -> R) -> R {
        match self {
            Ok(value) => on_ok(value),
            Err(error) => on_err(error),
        }
    }

    fn fold_ref<'a, R>(
        &'a self,
        on_ok: impl FnOnce(&'a T) -> R,
        on_err: impl FnOnce(&'a E) -> R,
    ) -> R
    where
        T: 'a,
        E: 'a,
    {
        match self {
            Ok(value) => on_ok(value),
            Err(error) => on_err(error),
        }
    }
}

/// Extension methods for [`Option`]
pub trait OptionExt<T> {
    /// Value if present, otherwise the lazily computed fallback.
    fn get_or_else(self, fallback: impl FnOnce() -> T) -> T;
}

impl<T> OptionExt<T> for Option<T> {
    fn get_or_else(self, fallback: impl FnOnce() -> T) -> T {
        self.unwrap_or_else(fallback)
    }
}
