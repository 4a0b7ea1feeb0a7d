//! Charge completion summary carried by `recarga-finalizada`

use crate::error::SummaryError;
use std::fmt;

const PLATE_MARKERS: [&str; 2] = ["Vehicle", "Veículo"];
const CONSUMPTION_MARKERS: [&str; 2] = ["Consumption:", "Consumo:"];
const AMOUNT_MARKERS: [&str; 2] = ["Amount: R$", "Valor: R$"];

/// Outcome of one charging session
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeSummary {
    pub plate: String,
    pub consumed_kwh: f64,
    pub amount: f64,
}

impl ChargeSummary {
    pub fn new(plate: impl Into<String>, consumed_kwh: f64, amount: f64) -> Self {
        Self {
            plate: plate.into(),
            consumed_kwh,
            amount,
        }
    }

    pub fn to_payload(&self) -> String {
        format!(
            "Vehicle {} served. Consumption: {:.2} kWh, Amount: R$ {:.2}",
            self.plate, self.consumed_kwh, self.amount
        )
    }

    /// Parse a summary, falling back to a lenient token scan if the text does
    /// not have the exact layout of [`ChargeSummary::to_payload`].
    pub fn parse(text: &str) -> Result<Self, SummaryError> {
        Self::parse_strict(text).or_else(|_| Self::parse_lenient(text))
    }

    fn parse_strict(text: &str) -> Result<Self, SummaryError> {
        let rest = text.strip_prefix("Vehicle ").ok_or(SummaryError::Malformed)?;
        let (plate, rest) = rest
            .split_once(" served. Consumption: ")
            .ok_or(SummaryError::Malformed)?;
        let (consumed, amount) = rest
            .split_once(" kWh, Amount: R$ ")
            .ok_or(SummaryError::Malformed)?;

        if plate.is_empty() || plate.contains(char::is_whitespace) {
            return Err(SummaryError::Malformed);
        }
        let consumed_kwh = consumed.parse().map_err(|_| SummaryError::Malformed)?;
        let amount = amount.parse().map_err(|_| SummaryError::Malformed)?;

        Ok(Self::new(plate, consumed_kwh, amount))
    }

    fn parse_lenient(text: &str) -> Result<Self, SummaryError> {
        let plate = after_marker(text, &PLATE_MARKERS)
            .and_then(|rest| rest.split_whitespace().next())
            .map(|token| token.trim_end_matches(|c: char| c == '.' || c == ',' || c == ':'))
            .filter(|plate| !plate.is_empty())
            .ok_or(SummaryError::MissingPlate)?;

        let consumed_kwh = after_marker(text, &CONSUMPTION_MARKERS)
            .map(|rest| rest.split("kWh").next().unwrap_or(rest))
            .and_then(leading_number)
            .unwrap_or(0.0);

        let amount = after_marker(text, &AMOUNT_MARKERS)
            .and_then(leading_number)
            .unwrap_or(0.0);

        Ok(Self::new(plate, consumed_kwh, amount))
    }
}

impl fmt::Display for ChargeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload())
    }
}

fn after_marker<'a>(text: &'a str, markers: &[&str]) -> Option<&'a str> {
    markers
        .iter()
        .find_map(|marker| text.split_once(marker).map(|(_, rest)| rest))
}

fn leading_number(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(text.len());
    text[..end].trim_end_matches('.').parse().ok()
}
