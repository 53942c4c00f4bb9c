use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use schemars::JsonSchema;
use serde::Deserialize;

pub const DEFAULT_CAPTION_PROMPT: &str = "Describe the image in detail as a prompt for an image \
generation model: subject, setting, lighting, colors, composition and style. Output only the description.";

/// Most images accepted in one caption request.
pub const MAX_IMAGES: usize = 8;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CaptionRequest {
    /// Service id from `listservices`.
    pub service: String,
    /// VLM model name. Defaults to the service's default VLM.
    pub model: Option<String>,
    /// Images as `data:image/...;base64,` URLs or plain http(s) URLs.
    pub images: Vec<String>,
    /// Extra instruction sent with the images (e.g. "focus on the clothing").
    pub prompt: Option<String>,
    /// Replaces the built-in captioning instructions.
    pub system_prompt: Option<String>,
    /// Caller-chosen id; pass the same id to `cancel` to stop this request.
    pub request_id: Option<String>,
}

impl CaptionRequest {
    pub fn system_prompt_or_default(&self) -> &str {
        self.system_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_CAPTION_PROMPT)
    }

    pub fn user_text(&self) -> &str {
        self.prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("Describe this image.")
    }

    /// Reject images that are neither http(s) URLs nor decodable base64
    /// data URLs. Returns the 1-based position of the first bad image.
    pub fn validate_images(&self) -> Result<(), String> {
        for (i, image) in self.images.iter().enumerate() {
            check_image(image).map_err(|e| format!("image {}: {e}", i + 1))?;
        }
        Ok(())
    }
}

fn check_image(image: &str) -> Result<(), String> {
    let image = image.trim();
    if image.starts_with("http://") || image.starts_with("https://") {
        return Ok(());
    }
    let Some(rest) = image.strip_prefix("data:") else {
        return Err("expected a data: URL or an http(s) URL".to_string());
    };
    let Some((mime, data)) = rest.split_once(";base64,") else {
        return Err("data URL is not base64-encoded".to_string());
    };
    if !mime.starts_with("image/") {
        return Err(format!("unsupported media type '{mime}'"));
    }
    BASE64_STANDARD
        .decode(data)
        .map(|_| ())
        .map_err(|e| format!("invalid base64 payload: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(images: &[&str]) -> CaptionRequest {
        CaptionRequest {
            service: "ollama".into(),
            model: None,
            images: images.iter().map(|s| s.to_string()).collect(),
            prompt: None,
            system_prompt: None,
            request_id: None,
        }
    }

    #[test]
    fn accepts_data_and_http_urls() {
        let req = request(&["data:image/png;base64,iVBORw0KGgo=", "https://example.com/a.jpg"]);
        assert!(req.validate_images().is_ok());
    }

    #[test]
    fn rejects_bad_images_with_position() {
        let err = request(&["https://example.com/a.jpg", "data:image/png;base64,@@@"])
            .validate_images()
            .unwrap_err();
        assert!(err.starts_with("image 2: invalid base64"));

        let err = request(&["data:text/plain;base64,aGk="]).validate_images().unwrap_err();
        assert!(err.contains("text/plain"));

        assert!(request(&["/tmp/cat.png"]).validate_images().is_err());
    }

    #[test]
    fn empty_prompt_uses_default_text() {
        let mut req = request(&[]);
        req.prompt = Some("  ".into());
        assert_eq!(req.user_text(), "Describe this image.");
    }
}
