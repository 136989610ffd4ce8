//! Address normalization seam.

/// Opaque raw → normalized address function. `None` means the input could not
/// be understood as a street address.
pub trait AddressNormalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> Option<String>;
}

/// Upper-cases, collapses whitespace, abbreviates common street suffixes and
/// appends the city/state (and zip, when one trails the input).
#[derive(Debug, Clone)]
pub struct BasicAddressNormalizer {
    city: String,
    state: String,
}

impl Default for BasicAddressNormalizer {
    fn default() -> Self {
        Self {
            city: "SAN FRANCISCO".to_string(),
            state: "CA".to_string(),
        }
    }
}

const SUFFIXES: &[(&str, &str)] = &[
    ("STREET", "ST"),
    ("AVENUE", "AVE"),
    ("BOULEVARD", "BLVD"),
    ("DRIVE", "DR"),
    ("PLACE", "PL"),
    ("TERRACE", "TER"),
    ("COURT", "CT"),
    ("LANE", "LN"),
    ("ROAD", "RD"),
    ("ALLEY", "ALY"),
    ("WAY", "WAY"),
];

impl BasicAddressNormalizer {
    pub fn new(city: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            city: city.into().to_uppercase(),
            state: state.into().to_uppercase(),
        }
    }
}

fn is_zip(token: &str) -> bool {
    token.len() == 5 && token.bytes().all(|b| b.is_ascii_digit())
}

impl AddressNormalizer for BasicAddressNormalizer {
    fn normalize(&self, raw: &str) -> Option<String> {
        let mut tokens: Vec<String> = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(|token| token.trim_end_matches('.').to_uppercase())
            .collect();

        let zip = match tokens.last() {
            Some(last) if tokens.len() > 2 && is_zip(last) => tokens.pop(),
            _ => None,
        };

        let house_number = tokens.first()?;
        if !house_number.starts_with(|c: char| c.is_ascii_digit()) || tokens.len() < 2 {
            return None;
        }

        for token in tokens.iter_mut().skip(1) {
            if let Some((_, short)) = SUFFIXES.iter().find(|(long, _)| *long == token.as_str()) {
                *token = (*short).to_string();
            }
        }

        let street = tokens.join(" ");
        Some(match zip {
            Some(zip) => format!("{street}, {}, {} {zip}", self.city, self.state),
            None => format!("{street}, {}, {}", self.city, self.state),
        })
    }
}
