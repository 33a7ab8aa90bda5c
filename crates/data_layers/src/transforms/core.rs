use anyhow::{Context, Result};
use std::marker::PhantomData;

/// A single decode-side step of a record source (load, resize, convert).
///
/// Steps are stateless and composed with `.then(...)` into one pipeline
/// that a source runs for every path it reads:
///
/// ```ignore
/// let decode = LoadImage::new(is_color)
///     .then(resize)               // Option<ResizeExact>
///     .then(ImageToTensor);
/// let tensor = decode.apply(path)?;
/// ```
///
/// Randomized work (crop offsets, mirroring) does not belong here; it lives
/// in a [`RecordTransform`](super::RecordTransform) that owns its RNG.
pub trait Transform<I, O>: Send + Sync {
    fn apply(&self, input: I) -> Result<O>;

    #[inline]
    fn then<T, M>(self, next: T) -> Chain<Self, T, O>
    where
        Self: Sized,
        T: Transform<O, M>,
        O: Send,
        M: Send,
    {
        Chain::new(self, next)
    }
}

/// Two steps run back to back (`A` then `B`), `M` being the value passed
/// between them.
#[derive(Debug, Clone)]
pub struct Chain<A, B, M> {
    first: A,
    second: B,
    _marker: PhantomData<fn() -> M>,
}

impl<A, B, M> Chain<A, B, M> {
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            _marker: PhantomData,
        }
    }
}

impl<I, M, O, A, B> Transform<I, O> for Chain<A, B, M>
where
    A: Transform<I, M>,
    B: Transform<M, O>,
    M: Send,
{
    fn apply(&self, input: I) -> Result<O> {
        let mid = self.first.apply(input)?;
        self.second.apply(mid).with_context(|| {
            format!(
                "Step {} failed after {}",
                short_type_name::<B>(),
                short_type_name::<A>()
            )
        })
    }
}

/// An optional step: `None` passes its input through unchanged.
impl<X, T> Transform<X, X> for Option<T>
where
    T: Transform<X, X>,
{
    fn apply(&self, input: X) -> Result<X> {
        match self {
            Some(step) => step.apply(input),
            None => Ok(input),
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
