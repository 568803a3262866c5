//! Generation backends and artifact file handling.

pub mod dashscope;
pub mod files;

pub use dashscope::{extract_result_url, DashScopeProcessor};
pub use files::{
    artifact_filename, artifact_tag, decode_image_id, encode_image_id, image_urls, safe_dir_name,
    IMAGE_URL_PREFIX,
};
