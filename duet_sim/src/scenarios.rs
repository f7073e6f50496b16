//! Chaos scenarios for the result-sync session.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: every result delivered twice, and re-published
    DuplicateDelivery,

    /// SIM-002: refused connects and a dropped connection mid-session
    FlakyBroker,

    /// SIM-003: broker never comes up, retry budget runs out
    BrokerOutage,

    /// SIM-004: garbage and half-formed payloads before the real one
    MalformedPayload,

    /// SIM-005: results for scenarios nobody asked for
    Unsolicited,

    /// SIM-006: case reload while a request is outstanding
    CaseReload,

    /// SIM-007: generated road network enriched, diffed and offset
    NetworkEnrichment,

    /// SIM-008: loss + duplication + drops across many scenarios at once
    ChaosStorm,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::DuplicateDelivery,
            ScenarioId::FlakyBroker,
            ScenarioId::BrokerOutage,
            ScenarioId::MalformedPayload,
            ScenarioId::Unsolicited,
            ScenarioId::CaseReload,
            ScenarioId::NetworkEnrichment,
            ScenarioId::ChaosStorm,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::DuplicateDelivery => "duplicate_delivery",
            ScenarioId::FlakyBroker => "flaky_broker",
            ScenarioId::BrokerOutage => "broker_outage",
            ScenarioId::MalformedPayload => "malformed_payload",
            ScenarioId::Unsolicited => "unsolicited",
            ScenarioId::CaseReload => "case_reload",
            ScenarioId::NetworkEnrichment => "network_enrichment",
            ScenarioId::ChaosStorm => "chaos_storm",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::DuplicateDelivery => "Each result delivered twice, verify the pending id is removed once",
            ScenarioId::FlakyBroker => "2 refused connects + forced drop, verify resubscription and delivery",
            ScenarioId::BrokerOutage => "Broker down, verify the manager gives up after max_retries",
            ScenarioId::MalformedPayload => "Malformed payloads keep the id pending until a valid result arrives",
            ScenarioId::Unsolicited => "Results for unknown scenario ids leave the registry untouched",
            ScenarioId::CaseReload => "Reload clears pending ids, late results are discarded",
            ScenarioId::NetworkEnrichment => "Synthetic network: delta = result - reference, offset applied once",
            ScenarioId::ChaosStorm => "20% loss + 30% duplication + drops, every scenario fulfilled exactly once",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "duplicate_delivery" | "duplicates" | "sim-001" => Ok(ScenarioId::DuplicateDelivery),
            "flaky_broker" | "flaky" | "sim-002" => Ok(ScenarioId::FlakyBroker),
            "broker_outage" | "outage" | "sim-003" => Ok(ScenarioId::BrokerOutage),
            "malformed_payload" | "malformed" | "sim-004" => Ok(ScenarioId::MalformedPayload),
            "unsolicited" | "sim-005" => Ok(ScenarioId::Unsolicited),
            "case_reload" | "reload" | "sim-006" => Ok(ScenarioId::CaseReload),
            "network_enrichment" | "enrichment" | "sim-007" => Ok(ScenarioId::NetworkEnrichment),
            "chaos_storm" | "chaos" | "sim-008" => Ok(ScenarioId::ChaosStorm),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
        }
        assert_eq!("SIM-003".parse::<ScenarioId>(), Ok(ScenarioId::BrokerOutage));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
