//! QR rendering for status relay.
//!
//! The client library emits the raw pairing payload; the control plane wants
//! an image it can show in a browser. The raw string is never logged.

use anyhow::Result;
use base64::Engine as _;

const MIN_SIZE: u32 = 256;

pub fn to_png_data_url(code: &str) -> Result<String> {
    let qr = qrcode::QrCode::new(code.as_bytes())?;
    let image = qr
        .render::<image::Luma<u8>>()
        .min_dimensions(MIN_SIZE, MIN_SIZE)
        .build();

    let mut png = Vec::new();
    image::DynamicImage::ImageLuma8(image)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)?;

    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&png)
    ))
}
