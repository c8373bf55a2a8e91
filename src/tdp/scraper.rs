//! Extracts package TDP and core count from vendor spec pages.
//!
//! The page is read as a flat token stream. Two layouts are recognised:
//! label/value rows (`tech-section-row` containing `tech-label` and
//! `tech-data`), and a `data-product-specs` attribute carrying a near-JSON
//! blob. Rows are anchored on their class markers only; the label and value
//! texts are a fixed number of tokens past their anchors.

use crate::tdp::repair::{RepairError, repair_and_parse};
use html5gum::{Token, Tokenizer};
use log::debug;
use serde::Deserialize;

pub const ROW_CLASS: &str = "tech-section-row";
pub const LABEL_CLASS: &str = "tech-label";
pub const VALUE_CLASS: &str = "tech-data";
pub const EMBEDDED_SPECS_ATTRIBUTE: &str = "data-product-specs";

/// Tokens from a `tech-label` anchor to its text (whitespace, `<span>`, text)
pub const LABEL_TEXT_OFFSET: usize = 3;
/// Tokens from a `tech-data` anchor to its text
pub const VALUE_TEXT_OFFSET: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupToken {
    StartTag {
        name: String,
        attributes: Vec<(String, String)>,
    },
    EndTag {
        name: String,
    },
    Text(String),
    /// Comments, doctypes and anything else that only occupies a position
    Other,
}

impl MarkupToken {
    fn attribute(&self, key: &str) -> Option<&str> {
        match self {
            MarkupToken::StartTag { attributes, .. } => attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .is_some_and(|value| value.split_whitespace().any(|c| c == class))
    }

    fn is_div(&self) -> bool {
        matches!(self, MarkupToken::StartTag { name, .. } if name == "div")
    }

    fn text(&self) -> &str {
        match self {
            MarkupToken::Text(text) => text.trim(),
            _ => "",
        }
    }
}

/// Tokenizes `html` without building a tree. Parse errors are dropped.
pub fn tokenize(html: &str) -> impl Iterator<Item = MarkupToken> + '_ {
    Tokenizer::new(html).infallible().filter_map(|token| match token {
        Token::StartTag(tag) => Some(MarkupToken::StartTag {
            name: lossy(&tag.name),
            attributes: tag
                .attributes
                .iter()
                .map(|(key, value)| (lossy(key), lossy(value)))
                .collect(),
        }),
        Token::EndTag(tag) => Some(MarkupToken::EndTag {
            name: lossy(&tag.name),
        }),
        Token::String(text) => Some(MarkupToken::Text(lossy(&text))),
        Token::Error(_) => None,
        _ => Some(MarkupToken::Other),
    })
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Values found on a spec page. Either may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PackageSpecs {
    /// W
    pub package_tdp: Option<f64>,
    pub core_count: Option<f64>,
}

impl PackageSpecs {
    pub fn watts_per_core(&self) -> Option<f64> {
        match (self.package_tdp, self.core_count) {
            (Some(tdp), Some(cores)) if tdp > 0.0 && cores > 0.0 => Some(tdp / cores),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecField {
    Tdp,
    TotalCores,
}

impl SpecField {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "TDP" => Some(SpecField::Tdp),
            "Total Cores" => Some(SpecField::TotalCores),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    SeekingRow,
    SeekingLabel,
    SkippingToLabel { remaining: usize },
    SeekingValue { field: SpecField },
    SkippingToValue { field: SpecField, remaining: usize },
}

#[derive(Debug, Deserialize)]
struct EmbeddedSpecs {
    #[serde(default)]
    elements: EmbeddedElements,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddedElements {
    #[serde(default)]
    default_tdp: FormattedValue,
    #[serde(default)]
    num_of_cpu_cores: FormattedValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormattedValue {
    #[serde(default)]
    format_value: String,
}

/// State machine over a markup token stream.
pub struct SpecScanner {
    state: ScanState,
    specs: PackageSpecs,
}

impl SpecScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::SeekingRow,
            specs: PackageSpecs::default(),
        }
    }

    pub fn feed(&mut self, token: &MarkupToken) -> Result<(), RepairError> {
        self.state = match self.state {
            ScanState::SeekingRow => {
                if token.is_div() {
                    if let Some(blob) = token.attribute(EMBEDDED_SPECS_ATTRIBUTE) {
                        self.read_embedded(blob)?;
                    }
                    if token.has_class(ROW_CLASS) {
                        ScanState::SeekingLabel
                    } else {
                        ScanState::SeekingRow
                    }
                } else {
                    ScanState::SeekingRow
                }
            }
            ScanState::SeekingLabel if token.has_class(LABEL_CLASS) => {
                ScanState::SkippingToLabel {
                    remaining: LABEL_TEXT_OFFSET,
                }
            }
            ScanState::SeekingLabel => ScanState::SeekingLabel,
            ScanState::SkippingToLabel { remaining } if remaining > 1 => {
                ScanState::SkippingToLabel {
                    remaining: remaining - 1,
                }
            }
            ScanState::SkippingToLabel { .. } => match SpecField::from_label(token.text()) {
                Some(field) => ScanState::SeekingValue { field },
                None => ScanState::SeekingRow,
            },
            ScanState::SeekingValue { field } if token.has_class(VALUE_CLASS) => {
                ScanState::SkippingToValue {
                    field,
                    remaining: VALUE_TEXT_OFFSET,
                }
            }
            ScanState::SeekingValue { field } => ScanState::SeekingValue { field },
            ScanState::SkippingToValue { field, remaining } if remaining > 1 => {
                ScanState::SkippingToValue {
                    field,
                    remaining: remaining - 1,
                }
            }
            ScanState::SkippingToValue { field, .. } => {
                self.record(field, token.text());
                ScanState::SeekingRow
            }
        };
        Ok(())
    }

    pub fn finish(self) -> PackageSpecs {
        self.specs
    }

    fn record(&mut self, field: SpecField, value: &str) {
        match field {
            SpecField::Tdp => {
                // Only "<number> W" is a package TDP
                if !value.ends_with(" W") {
                    return;
                }
                if let Some(watts) = parse_watts(value) {
                    self.specs.package_tdp = Some(watts);
                }
            }
            SpecField::TotalCores => {
                if let Ok(cores) = value.parse::<f64>() {
                    self.specs.core_count = Some(cores);
                }
            }
        }
    }

    fn read_embedded(&mut self, blob: &str) -> Result<(), RepairError> {
        let specs: EmbeddedSpecs = repair_and_parse(blob)?;
        let tdp = parse_watts(&specs.elements.default_tdp.format_value);
        let cores = specs.elements.num_of_cpu_cores.format_value.trim().parse::<f64>().ok();
        if let (Some(tdp), Some(cores)) = (tdp, cores) {
            debug!("Embedded specs: {} W over {} cores", tdp, cores);
            self.specs.package_tdp = Some(tdp);
            self.specs.core_count = Some(cores);
        }
        Ok(())
    }
}

impl Default for SpecScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_watts(value: &str) -> Option<f64> {
    value
        .trim()
        .trim_end_matches(|c: char| c == 'W' || c.is_whitespace())
        .parse::<f64>()
        .ok()
}

/// Scans a whole spec page.
pub fn scan_spec_page(html: &str) -> Result<PackageSpecs, RepairError> {
    let mut scanner = SpecScanner::new();
    for token in tokenize(html) {
        scanner.feed(&token)?;
    }
    Ok(scanner.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(label: &str, value: &str) -> String {
        format!(
            r#"<div class="tech-section-row">
  <div class="col-xs-6 col-lg-6 tech-label">
    <span>{label}</span>
  </div>
  <div class="col-xs-6 col-lg-6 tech-data" data-key="x">
    <span>{value}</span>
  </div>
</div>
"#
        )
    }

    #[test]
    fn test_label_value_rows() {
        let html = format!(
            "<html><body>{}{}{}</body></html>",
            row("Processor Number", "i9-13900K"),
            row("Total Cores", "24"),
            row("TDP", "125 W"),
        );
        let specs = scan_spec_page(&html).unwrap();
        assert_eq!(specs.core_count, Some(24.0));
        assert_eq!(specs.package_tdp, Some(125.0));
        assert!((specs.watts_per_core().unwrap() - 125.0 / 24.0).abs() < 1e-12);
    }

    #[test]
    fn test_tdp_without_watt_suffix_is_ignored() {
        let html = format!("{}{}", row("Total Cores", "8"), row("TDP", "65"));
        let specs = scan_spec_page(&html).unwrap();
        assert_eq!(specs.package_tdp, None);
        assert_eq!(specs.watts_per_core(), None);
    }

    #[test]
    fn test_label_must_sit_at_offset() {
        // The label text is only two tokens past its anchor here
        let html = r#"<div class="tech-section-row"><div class="tech-label">TDP</div><div class="tech-data"><span>125 W</span></div></div>"#;
        let specs = scan_spec_page(html).unwrap();
        assert_eq!(specs, PackageSpecs::default());
    }

    #[test]
    fn test_embedded_attribute_blob() {
        let html = r#"<div class="product" data-product-specs="{&quot;elements&quot;:{&quot;defaultTdp&quot;:{&quot;formatValue&quot;:&quot;170W&quot;},&quot;numOfCpuCores&quot;:{&quot;formatValue&quot;:&quot;16&quot;},},}"></div>"#;
        let specs = scan_spec_page(html).unwrap();
        assert_eq!(specs.package_tdp, Some(170.0));
        assert_eq!(specs.core_count, Some(16.0));
        assert!((specs.watts_per_core().unwrap() - 10.625).abs() < 1e-12);
    }

    #[test]
    fn test_embedded_blob_with_single_quotes() {
        let html = r#"<div data-product-specs="{'elements': {'defaultTdp': {'formatValue': '105 W'}, 'numOfCpuCores': {'formatValue': '8'}}}"></div>"#;
        let specs = scan_spec_page(html).unwrap();
        assert_eq!(specs.watts_per_core(), Some(105.0 / 8.0));
    }

    #[test]
    fn test_embedded_blob_without_cores_leaves_specs_empty() {
        let html = r#"<div data-product-specs="{'elements': {'defaultTdp': {'formatValue': '105W'}}}"></div>"#;
        let specs = scan_spec_page(html).unwrap();
        assert_eq!(specs, PackageSpecs::default());
    }

    #[test]
    fn test_garbage_embedded_blob_is_an_error() {
        let html = r#"<div data-product-specs="definitely not json"></div>"#;
        assert!(scan_spec_page(html).is_err());
    }

    #[test]
    fn test_page_without_markers() {
        let specs = scan_spec_page("<html><p>TDP 125 W</p></html>").unwrap();
        assert_eq!(specs.watts_per_core(), None);
    }

    #[test]
    fn test_tokenize_keeps_whitespace_text() {
        let tokens: Vec<_> = tokenize("<div class=\"a b\">\n<span>x</span></div>").collect();
        assert!(tokens[0].has_class("b"));
        assert_eq!(tokens[1], MarkupToken::Text("\n".to_string()));
        assert!(matches!(&tokens[2], MarkupToken::StartTag { name, .. } if name == "span"));
        assert_eq!(tokens[3].text(), "x");
    }

    #[test]
    fn test_scanner_state_walk() {
        let mut scanner = SpecScanner::new();
        let anchor = MarkupToken::StartTag {
            name: "div".to_string(),
            attributes: vec![("class".to_string(), ROW_CLASS.to_string())],
        };
        scanner.feed(&anchor).unwrap();
        assert_eq!(scanner.state, ScanState::SeekingLabel);

        let label = MarkupToken::StartTag {
            name: "div".to_string(),
            attributes: vec![("class".to_string(), LABEL_CLASS.to_string())],
        };
        scanner.feed(&label).unwrap();
        assert_eq!(
            scanner.state,
            ScanState::SkippingToLabel {
                remaining: LABEL_TEXT_OFFSET
            }
        );
        for _ in 1..LABEL_TEXT_OFFSET {
            scanner.feed(&MarkupToken::Other).unwrap();
        }
        scanner.feed(&MarkupToken::Text(" Total Cores ".to_string())).unwrap();
        assert_eq!(
            scanner.state,
            ScanState::SeekingValue {
                field: SpecField::TotalCores
            }
        );
    }
}
