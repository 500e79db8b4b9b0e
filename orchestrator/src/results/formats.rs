//! Format checks for result payloads
//!
//! The JSON and CSV formats are fully parsed; the other types only get a
//! sniff of their encoding.

use serde::{Deserialize, Serialize};

use super::{ArtifactSummary, ResultError, ResultType};

pub const PROFILE_CSV_HEADER: [&str; 6] = [
    "function",
    "address",
    "count",
    "percent",
    "self_cycles",
    "cumulative_cycles",
];

/// Body of a `performance` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub cycles: u64,
    pub instructions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_hz: Option<f64>,
}

impl Performance {
    pub fn instructions_per_cycle(&self) -> Option<f64> {
        (self.cycles > 0).then(|| self.instructions as f64 / self.cycles as f64)
    }

    pub fn execution_time_sec(&self) -> Option<f64> {
        self.frequency_hz.map(|hz| self.cycles as f64 / hz)
    }
}

/// Body of a `simulation_speed` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSpeed {
    pub simulated_time_sec: f64,
    pub execution_time_sec: f64,
}

impl SimulationSpeed {
    /// Simulated time per second of wall-clock time
    pub fn real_time_factor(&self) -> Result<f64, ResultError> {
        if self.execution_time_sec == 0.0 {
            return Err(ResultError::DivisionUndefined);
        }
        Ok(self.simulated_time_sec / self.execution_time_sec)
    }
}

/// One row of a function profile, address normalized
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionEntry {
    pub function: String,
    pub address: u64,
    pub count: u64,
    pub percent: f64,
    pub self_cycles: u64,
    pub cumulative_cycles: u64,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    function: String,
    address: String,
    count: u64,
    percent: f64,
    self_cycles: u64,
    cumulative_cycles: u64,
}

/// Parsed `profile_csv` artifact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionProfile {
    pub entries: Vec<FunctionEntry>,
}

impl FunctionProfile {
    pub fn parse(content: &[u8]) -> Result<Self, String> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content);

        let headers = reader.headers().map_err(|e| e.to_string())?.clone();
        if !headers.iter().eq(PROFILE_CSV_HEADER.iter().copied()) {
            return Err(format!(
                "expected header '{}', found '{}'",
                PROFILE_CSV_HEADER.join(","),
                headers.iter().collect::<Vec<_>>().join(",")
            ));
        }

        let mut entries = Vec::new();
        for (index, row) in reader.deserialize::<ProfileRow>().enumerate() {
            let row = row.map_err(|e| format!("row {}: {}", index + 1, e))?;
            let digits = row
                .address
                .strip_prefix("0x")
                .or_else(|| row.address.strip_prefix("0X"))
                .unwrap_or(&row.address);
            let address = u64::from_str_radix(digits, 16)
                .map_err(|_| format!("row {}: '{}' is not a hex address", index + 1, row.address))?;

            entries.push(FunctionEntry {
                function: row.function,
                address,
                count: row.count,
                percent: row.percent,
                self_cycles: row.self_cycles,
                cumulative_cycles: row.cumulative_cycles,
            });
        }

        Ok(Self { entries })
    }

    pub fn total_self_cycles(&self) -> u64 {
        self.entries.iter().map(|e| e.self_cycles).sum()
    }
}

/// Check `content` against `result_type` and summarize structured formats
pub(crate) fn inspect(
    slot: &str,
    result_type: ResultType,
    content: &[u8],
) -> Result<Option<ArtifactSummary>, ResultError> {
    let mismatch = |reason: &str| ResultError::TypeMismatch {
        slot: slot.to_string(),
        expected: result_type,
        reason: reason.to_string(),
    };
    let schema = |reason: String| ResultError::SchemaViolation {
        slot: slot.to_string(),
        expected: result_type,
        reason,
    };

    match result_type {
        ResultType::Binary | ResultType::Fst | ResultType::Gprof => {
            if content.is_empty() {
                return Err(mismatch("payload is empty"));
            }
            Ok(None)
        }
        ResultType::Text => {
            std::str::from_utf8(content).map_err(|_| mismatch("payload is not UTF-8 text"))?;
            Ok(None)
        }
        ResultType::Vcd => {
            let text = std::str::from_utf8(content).map_err(|_| mismatch("payload is not UTF-8 text"))?;
            if !text.trim_start().starts_with('$') {
                return Err(mismatch("VCD must start with a $ declaration"));
            }
            Ok(None)
        }
        ResultType::JunitXml => {
            let text = std::str::from_utf8(content).map_err(|_| mismatch("payload is not UTF-8 text"))?;
            if !text.contains("<testsuite") {
                return Err(mismatch("no <testsuite> element"));
            }
            Ok(None)
        }
        ResultType::Performance => {
            let body: Performance = parse_json(content).map_err(|reason| schema(reason))?;
            if let Some(hz) = body.frequency_hz {
                if !(hz.is_finite() && hz > 0.0) {
                    return Err(schema(format!("frequency_hz must be positive, got {}", hz)));
                }
            }
            Ok(Some(ArtifactSummary::Performance {
                cycles: body.cycles,
                instructions: body.instructions,
                frequency_hz: body.frequency_hz,
                instructions_per_cycle: body.instructions_per_cycle(),
                execution_time_sec: body.execution_time_sec(),
            }))
        }
        ResultType::SimulationSpeed => {
            let body: SimulationSpeed = parse_json(content).map_err(|reason| schema(reason))?;
            for (field, value) in [
                ("simulated_time_sec", body.simulated_time_sec),
                ("execution_time_sec", body.execution_time_sec),
            ] {
                if !(value.is_finite() && value >= 0.0) {
                    return Err(schema(format!("{} must be non-negative, got {}", field, value)));
                }
            }
            Ok(Some(ArtifactSummary::SimulationSpeed {
                simulated_time_sec: body.simulated_time_sec,
                execution_time_sec: body.execution_time_sec,
                real_time_factor: body.real_time_factor().ok(),
            }))
        }
        ResultType::ProfileCsv => {
            let profile = FunctionProfile::parse(content).map_err(schema)?;
            Ok(Some(ArtifactSummary::FunctionProfile {
                functions: profile.entries.len(),
                total_self_cycles: profile.total_self_cycles(),
            }))
        }
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(content: &[u8]) -> Result<T, String> {
    let value: serde_json::Value =
        serde_json::from_slice(content).map_err(|e| format!("invalid JSON: {}", e))?;
    if !value.is_object() {
        return Err("expected a JSON object".to_string());
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}
