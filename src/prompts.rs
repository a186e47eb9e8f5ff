//! Instruction prompts for manifest extraction.
//!
//! Every prompt lives here so the wording can change without touching the
//! retry or parsing logic, and so tests can check the field names the
//! response normaliser relies on are actually requested.
//!
//! Callers can override the instructions via
//! [`crate::config::ExtractionConfig::system_prompt`].

use crate::config::ExtractionMode;

/// Field list shared by both modes. The keys match what
/// [`crate::pipeline::normalize`] looks up first.
const FIELD_SPEC: &str = r#"Return one JSON object per cargo line with exactly these keys:
  - "Name": vessel name (string, or null when absent)
  - "Flag": flag state / country code (string)
  - "Produits": products carried, comma separated (string)
  - "Volume": volume in m3 (number, or null)
  - "Poids": weight in kg (number)
  - "DATE": date of the manifest, formatted YYYY-MM-DD (string)
  - "Page": the page number the line was read from (number)"#;

/// Default instructions for text mode: page text and tables are inlined.
pub const TEXT_MODE_PROMPT: &str = r#"You read shipping cargo manifests. The content below contains page text and tables, each page introduced by a "--- Page N ---" marker.

Extract every cargo line you can find."#;

/// Default instructions for document mode: the pages arrive as a PDF.
pub const DOCUMENT_MODE_PROMPT: &str = r#"You read shipping cargo manifests. The attached PDF contains a few pages of a larger manifest.

Extract every cargo line present in the file."#;

/// Output contract appended to every prompt.
pub const OUTPUT_RULES: &str = r#"When several lines are found, return a JSON array of objects.
Output ONLY valid JSON: no commentary, no explanations, no markdown fences."#;

/// The default instructions for a mode, including field list and output rules.
pub fn default_instructions(mode: ExtractionMode) -> String {
    let intro = match mode {
        ExtractionMode::Text => TEXT_MODE_PROMPT,
        ExtractionMode::Document => DOCUMENT_MODE_PROMPT,
    };
    format!("{intro}\n\n{FIELD_SPEC}\n\n{OUTPUT_RULES}")
}

/// Wrap a text-mode payload as the user turn.
pub fn text_mode_user_message(content: &str) -> String {
    format!("Content:\n\n{content}\n\nGenerate ONLY the JSON.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_request_every_normalised_key() {
        for mode in [ExtractionMode::Text, ExtractionMode::Document] {
            let p = default_instructions(mode);
            for key in ["\"Name\"", "\"Flag\"", "\"Produits\"", "\"Volume\"", "\"Poids\"", "\"DATE\""] {
                assert!(p.contains(key), "{mode} prompt missing {key}");
            }
        }
    }

    #[test]
    fn text_message_embeds_content() {
        let m = text_mode_user_message("--- Page 1 ---\nKOUROS QUEEN");
        assert!(m.contains("KOUROS QUEEN"));
    }
}
