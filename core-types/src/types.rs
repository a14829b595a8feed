// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionType {
    type Err = SnapshotParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "call" => Ok(OptionType::Call),
            "put" => Ok(OptionType::Put),
            other => Err(SnapshotParseError::UnknownContractType(other.to_string())),
        }
    }
}

/// Natural key of a live contract row. Key fields never change after the row
/// is created; the ordering makes grouped iteration deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContractKey {
    pub symbol: String,
    pub expiration_date: NaiveDate,
    pub strike: Decimal,
    pub option_type: OptionType,
}

/// One option contract snapshot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub symbol: String,
    pub expiration_date: NaiveDate,
    pub strike: Decimal,
    pub option_type: OptionType,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: i64,
    pub open_interest: i64,
    pub implied_volatility: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl ContractRecord {
    pub fn key(&self) -> ContractKey {
        ContractKey {
            symbol: self.symbol.clone(),
            expiration_date: self.expiration_date,
            strike: self.strike,
            option_type: self.option_type,
        }
    }

    /// Overwrite the fields an upsert is allowed to change. Key fields are
    /// untouched.
    pub fn apply_update(&mut self, incoming: &ContractRecord) {
        self.bid = incoming.bid;
        self.ask = incoming.ask;
        self.last = incoming.last;
        self.volume = incoming.volume;
        self.open_interest = incoming.open_interest;
        self.implied_volatility = incoming.implied_volatility;
        self.delta = incoming.delta;
        self.gamma = incoming.gamma;
        self.theta = incoming.theta;
        self.vega = incoming.vega;
        self.updated_at = incoming.updated_at;
    }
}

/// A contract row as persisted, with its store-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredContract {
    pub id: i64,
    #[serde(flatten)]
    pub record: ContractRecord,
}

/// Archived copy of a live contract. A contract transitions live to
/// historical exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalContractRecord {
    pub original_id: i64,
    pub archived_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: ContractRecord,
}

impl HistoricalContractRecord {
    pub fn from_stored(stored: &StoredContract, archived_at: DateTime<Utc>) -> Self {
        Self {
            original_id: stored.id,
            archived_at,
            record: stored.record.clone(),
        }
    }
}

/// Raw snapshot row as delivered by the market-data acquisition client.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionSnapshot {
    pub ticker: String,
    pub strike: Decimal,
    pub expiration_date: String,
    pub contract_type: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: i64,
    pub open_interest: i64,
    #[serde(default)]
    pub implied_volatility: Option<f64>,
    #[serde(default)]
    pub delta: Option<f64>,
    #[serde(default)]
    pub gamma: Option<f64>,
    #[serde(default)]
    pub theta: Option<f64>,
    #[serde(default)]
    pub vega: Option<f64>,
}

#[derive(Debug, Error)]
pub enum SnapshotParseError {
    #[error("unknown contract type: {0}")]
    UnknownContractType(String),
    #[error("invalid expiration date {value}: {source}")]
    InvalidExpiration {
        value: String,
        source: chrono::ParseError,
    },
}

impl OptionSnapshot {
    /// Validate the raw row and produce the record that gets upserted.
    pub fn into_record(
        self,
        updated_at: DateTime<Utc>,
    ) -> Result<ContractRecord, SnapshotParseError> {
        let expiration_date = NaiveDate::parse_from_str(&self.expiration_date, "%Y-%m-%d")
            .map_err(|source| SnapshotParseError::InvalidExpiration {
                value: self.expiration_date.clone(),
                source,
            })?;
        let option_type = self.contract_type.parse::<OptionType>()?;
        Ok(ContractRecord {
            symbol: self.ticker,
            expiration_date,
            strike: self.strike,
            option_type,
            bid: self.bid,
            ask: self.ask,
            last: self.last,
            volume: self.volume,
            open_interest: self.open_interest,
            implied_volatility: self.implied_volatility,
            delta: self.delta,
            gamma: self.gamma,
            theta: self.theta,
            vega: self.vega,
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> OptionSnapshot {
        OptionSnapshot {
            ticker: "SPY".to_string(),
            strike: Decimal::new(450_00, 2),
            expiration_date: "2026-09-18".to_string(),
            contract_type: "call".to_string(),
            bid: Decimal::new(1_40, 2),
            ask: Decimal::new(1_60, 2),
            last: Decimal::new(1_50, 2),
            volume: 1_200,
            open_interest: 5_400,
            implied_volatility: Some(0.22),
            delta: Some(0.45),
            gamma: None,
            theta: None,
            vega: None,
        }
    }

    #[test]
    fn snapshot_converts_to_record() {
        let now = Utc::now();
        let record = sample_snapshot().into_record(now).unwrap();
        assert_eq!(record.symbol, "SPY");
        assert_eq!(
            record.expiration_date,
            NaiveDate::from_ymd_opt(2026, 9, 18).unwrap()
        );
        assert_eq!(record.option_type, OptionType::Call);
        assert_eq!(record.updated_at, now);
    }

    #[test]
    fn snapshot_rejects_unknown_contract_type() {
        let mut raw = sample_snapshot();
        raw.contract_type = "straddle".to_string();
        let err = raw.into_record(Utc::now()).unwrap_err();
        assert!(matches!(err, SnapshotParseError::UnknownContractType(_)));
    }

    #[test]
    fn snapshot_rejects_malformed_expiration() {
        let mut raw = sample_snapshot();
        raw.expiration_date = "18/09/2026".to_string();
        let err = raw.into_record(Utc::now()).unwrap_err();
        assert!(matches!(err, SnapshotParseError::InvalidExpiration { .. }));
    }

    #[test]
    fn apply_update_leaves_key_fields_alone() {
        let now = Utc::now();
        let mut current = sample_snapshot().into_record(now).unwrap();
        let mut incoming = current.clone();
        incoming.bid = Decimal::new(2_00, 2);
        incoming.ask = Decimal::new(2_20, 2);
        incoming.updated_at = now + chrono::Duration::seconds(30);
        current.apply_update(&incoming);
        assert_eq!(current.bid, Decimal::new(2_00, 2));
        assert_eq!(current.ask, Decimal::new(2_20, 2));
        assert_eq!(current.updated_at, incoming.updated_at);
        assert_eq!(current.strike, Decimal::new(450_00, 2));
        assert_eq!(current.option_type, OptionType::Call);
    }
}
