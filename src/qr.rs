use qrcode::render::svg;
use qrcode::types::QrError;
use qrcode::QrCode;

const SIZE: u32 = 350;
const DARK: &str = "#000000";
const FADED: &str = "#00000033";
const LIGHT: &str = "#FFFFFF";

// placeholders render faded
pub fn render_svg(payload: &str, placeholder: bool) -> Result<String, QrError> {
    let dark = if placeholder { FADED } else { DARK };
    let image = QrCode::new(payload.as_bytes())?
        .render::<svg::Color>()
        .min_dimensions(SIZE, SIZE)
        .dark_color(svg::Color(dark))
        .light_color(svg::Color(LIGHT))
        .build();
    Ok(image)
}
