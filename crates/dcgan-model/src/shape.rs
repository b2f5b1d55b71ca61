use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{tensor} has shape {actual:?}, expected [batch, {channels}, {size}, {size}]")]
pub struct ShapeError {
    pub tensor: &'static str,
    pub actual: Vec<usize>,
    pub channels: usize,
    pub size: usize,
}

/// Checks that `dims` describes a batch of `channels x size x size` images.
pub fn ensure_image_shape(
    tensor: &'static str,
    dims: &[usize],
    channels: usize,
    size: usize,
) -> Result<(), ShapeError> {
    match dims {
        [_, c, h, w] if *c == channels && *h == size && *w == size => Ok(()),
        _ => Err(ShapeError {
            tensor,
            actual: dims.to_vec(),
            channels,
            size,
        }),
    }
}
