use image::{imageops::FilterType, DynamicImage, ImageReader};
use ndarray::{Array, Ix4};
use std::io::Cursor;
use thiserror::Error;

pub const INPUT_WIDTH: u32 = 224;
pub const INPUT_HEIGHT: u32 = 224;
pub const INPUT_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("{0}")]
    Format(std::io::Error),
    #[error("{0}")]
    Decode(#[from] image::ImageError),
    #[error("{0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Turns an encoded image into the classifier input: a `(1, 224, 224, 3)`
/// channel-last tensor holding raw 0-255 pixel values.
///
/// The image is stretched to the target size. Every color type is converted
/// to 8-bit RGB: alpha is dropped without blending, grayscale and palette
/// images are expanded, 16-bit channels are scaled down.
pub fn preprocess(image_data: &[u8]) -> Result<Array<f32, Ix4>, PreprocessError> {
    let image_reader = ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(PreprocessError::Format)?;

    let decoded = image_reader.decode()?;
    image_to_tensor(&decoded)
}

fn image_to_tensor(img: &DynamicImage) -> Result<Array<f32, Ix4>, PreprocessError> {
    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(&rgb, INPUT_WIDTH, INPUT_HEIGHT, FilterType::CatmullRom);

    let data: Vec<f32> = resized.into_raw().into_iter().map(f32::from).collect();
    let shape = (
        1,
        INPUT_HEIGHT as usize,
        INPUT_WIDTH as usize,
        INPUT_CHANNELS,
    );

    Ok(Array::from_shape_vec(shape, data)?)
}
