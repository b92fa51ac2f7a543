pub mod check;
pub mod ocr;
