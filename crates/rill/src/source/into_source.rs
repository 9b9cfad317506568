use super::Source;

/// Conversion into a [`Source`], the seam the flattening operators use to
/// accept "stream-like" values: an inner stream, a ready collection, or
/// anything else coercible to a chunk sequence.
pub trait IntoSource {
    type Item: Send + 'static;

    fn into_source(self) -> Source<Self::Item>;
}

impl<T: Send + 'static> IntoSource for Source<T> {
    type Item = T;

    fn into_source(self) -> Source<T> {
        self
    }
}

impl<T: Send + 'static> IntoSource for Vec<T> {
    type Item = T;

    fn into_source(self) -> Source<T> {
        crate::create::from_iter(self)
    }
}

impl<T: Send + 'static, const N: usize> IntoSource for [T; N] {
    type Item = T;

    fn into_source(self) -> Source<T> {
        crate::create::from_iter(self)
    }
}
