// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Runtime configuration from the environment (and `.env`).

use crate::PaymentError;
use crate::retry::RetryPolicy;
use rust_decimal::Decimal;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on `INVOICE_DUE_DAYS`, ten years.
pub const MAX_INVOICE_DUE_DAYS: u32 = 3650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtnMomoConfig {
    pub base_url: String,
    pub api_user: String,
    pub api_key: String,
    pub subscription_key: String,
    pub webhook_secret: String,
    /// `X-Target-Environment` header value.
    pub target_environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirtelMoneyConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: String,
    pub country: String,
    /// Merchant wallet currency.
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankTransferConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_hash: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// How long a payment may await confirmation before the sweep times it out.
    pub confirmation_window: Duration,
    pub sweep_interval: Duration,
    /// Bound on every outbound gateway call.
    pub gateway_timeout: Duration,
    pub retry: RetryPolicy,
    pub reconciliation_tolerance: Decimal,
    pub invoice_tax_rate: Decimal,
    pub invoice_due_days: u32,
    /// `sandbox` or `production`.
    pub environment: String,
    pub mtn: Option<MtnMomoConfig>,
    pub airtel: Option<AirtelMoneyConfig>,
    pub bank: Option<BankTransferConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            confirmation_window: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
            gateway_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            reconciliation_tolerance: Decimal::new(1, 2),
            invoice_tax_rate: Decimal::ZERO,
            invoice_due_days: 0,
            environment: "sandbox".to_string(),
            mtn: None,
            airtel: None,
            bank: None,
        }
    }
}

impl Config {
    /// Reads `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self, PaymentError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PaymentError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let environment = get("PAYMENT_ENVIRONMENT").unwrap_or(defaults.environment);
        let sandbox = environment != "production";

        let retry = RetryPolicy {
            max_attempts: parse(&get, "RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            initial_delay: Duration::from_millis(parse(
                &get,
                "RETRY_INITIAL_DELAY_MS",
                defaults.retry.initial_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse(
                &get,
                "RETRY_MAX_DELAY_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
            ..defaults.retry
        };

        let tolerance: Decimal = parse(&get, "RECONCILIATION_TOLERANCE", defaults.reconciliation_tolerance)?;
        if tolerance < Decimal::ZERO {
            return Err(PaymentError::Config("RECONCILIATION_TOLERANCE must not be negative".into()));
        }
        let tax_rate: Decimal = parse(&get, "INVOICE_TAX_RATE", defaults.invoice_tax_rate)?;
        if tax_rate < Decimal::ZERO || tax_rate >= Decimal::ONE {
            return Err(PaymentError::Config("INVOICE_TAX_RATE must be in [0, 1)".into()));
        }
        let invoice_due_days: u32 = parse(&get, "INVOICE_DUE_DAYS", defaults.invoice_due_days)?;
        if invoice_due_days > MAX_INVOICE_DUE_DAYS {
            return Err(PaymentError::Config(format!(
                "INVOICE_DUE_DAYS must be at most {MAX_INVOICE_DUE_DAYS}"
            )));
        }

        let mtn = section(
            &get,
            "MTN_MOMO",
            &["API_USER", "API_KEY", "SUBSCRIPTION_KEY", "WEBHOOK_SECRET"],
            |v| MtnMomoConfig {
                base_url: get("MTN_MOMO_BASE_URL").unwrap_or_else(|| {
                    if sandbox {
                        "https://sandbox.momodeveloper.mtn.com".to_string()
                    } else {
                        "https://api.momodeveloper.mtn.com".to_string()
                    }
                }),
                api_user: v[0].clone(),
                api_key: v[1].clone(),
                subscription_key: v[2].clone(),
                webhook_secret: v[3].clone(),
                target_environment: get("MTN_MOMO_TARGET_ENVIRONMENT")
                    .unwrap_or_else(|| environment.clone()),
            },
        )?;

        let airtel = section(
            &get,
            "AIRTEL_MONEY",
            &["CLIENT_ID", "CLIENT_SECRET", "WEBHOOK_SECRET"],
            |v| AirtelMoneyConfig {
                base_url: get("AIRTEL_MONEY_BASE_URL").unwrap_or_else(|| {
                    if sandbox {
                        "https://openapiuat.airtel.africa".to_string()
                    } else {
                        "https://openapi.airtel.africa".to_string()
                    }
                }),
                client_id: v[0].clone(),
                client_secret: v[1].clone(),
                webhook_secret: v[2].clone(),
                country: get("AIRTEL_MONEY_COUNTRY").unwrap_or_else(|| "RW".to_string()),
                currency: get("AIRTEL_MONEY_CURRENCY").unwrap_or_else(|| "RWF".to_string()),
            },
        )?;

        let bank = section(&get, "BANK_TRANSFER", &["SECRET_KEY", "WEBHOOK_HASH"], |v| {
            BankTransferConfig {
                base_url: get("BANK_TRANSFER_BASE_URL")
                    .unwrap_or_else(|| "https://api.flutterwave.com/v3".to_string()),
                secret_key: v[0].clone(),
                webhook_hash: v[1].clone(),
                redirect_url: get("BANK_TRANSFER_REDIRECT_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:3000/payments/callback".to_string()),
            }
        })?;

        Ok(Self {
            host: get("SETTLEMENT_HOST").unwrap_or(defaults.host),
            port: parse(&get, "SETTLEMENT_PORT", defaults.port)?,
            confirmation_window: Duration::from_secs(parse(
                &get,
                "CONFIRMATION_WINDOW_SECS",
                defaults.confirmation_window.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse(
                &get,
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            gateway_timeout: Duration::from_secs(parse(
                &get,
                "GATEWAY_TIMEOUT_SECS",
                defaults.gateway_timeout.as_secs(),
            )?),
            retry,
            reconciliation_tolerance: tolerance,
            invoice_tax_rate: tax_rate,
            invoice_due_days,
            environment,
            mtn,
            airtel,
            bank,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, PaymentError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PaymentError::Config(format!("{key}={raw}: {e}"))),
    }
}

/// A provider section is either fully configured, absent, or an error.
fn section<T>(
    get: &impl Fn(&str) -> Option<String>,
    prefix: &str,
    required: &[&str],
    build: impl FnOnce(&[String]) -> T,
) -> Result<Option<T>, PaymentError> {
    let keys: Vec<String> = required.iter().map(|k| format!("{prefix}_{k}")).collect();
    let values: Vec<Option<String>> = keys.iter().map(|k| get(k)).collect();
    if values.iter().all(Option::is_none) {
        return Ok(None);
    }
    let missing: Vec<&str> = keys
        .iter()
        .zip(&values)
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| k.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(PaymentError::Config(format!(
            "{prefix} is partially configured, missing {}",
            missing.join(", ")
        )));
    }
    let values: Vec<String> = values.into_iter().flatten().collect();
    Ok(Some(build(&values)))
}
