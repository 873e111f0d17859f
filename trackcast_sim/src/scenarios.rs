//! Fault scenarios for deterministic publisher simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// TRK-001: Clean trip, every sample paced by the resolution
    SteadyTrip,

    /// TRK-002: Lossy transport, skipped locations must be carried forward
    FlakyNetwork,

    /// TRK-003: Concurrent adds of one trackable
    DuplicateAdds,

    /// TRK-004: Remove issued while the add is still connecting
    RemoveWhileAdding,

    /// TRK-005: Arrival switches to the near resolution
    ProximityArrival,

    /// TRK-006: Battery drains below the threshold mid-trip
    LowBattery,

    /// TRK-007: Subscribers join, update and leave
    SubscriberChurn,

    /// TRK-008: Channel fails, publishing must cease
    FatalChannel,

    /// TRK-009: Stop while a connection attempt hangs
    StopTimeout,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyTrip,
            ScenarioId::FlakyNetwork,
            ScenarioId::DuplicateAdds,
            ScenarioId::RemoveWhileAdding,
            ScenarioId::ProximityArrival,
            ScenarioId::LowBattery,
            ScenarioId::SubscriberChurn,
            ScenarioId::FatalChannel,
            ScenarioId::StopTimeout,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyTrip => "steady_trip",
            ScenarioId::FlakyNetwork => "flaky_network",
            ScenarioId::DuplicateAdds => "duplicate_adds",
            ScenarioId::RemoveWhileAdding => "remove_while_adding",
            ScenarioId::ProximityArrival => "proximity_arrival",
            ScenarioId::LowBattery => "low_battery",
            ScenarioId::SubscriberChurn => "subscriber_churn",
            ScenarioId::FatalChannel => "fatal_channel",
            ScenarioId::StopTimeout => "stop_timeout",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyTrip => "1 Hz trip at walking pace, every due location published",
            ScenarioId::FlakyNetwork => "30% publish loss, no location silently dropped",
            ScenarioId::DuplicateAdds => "5 concurrent adds of one trackable share one connection",
            ScenarioId::RemoveWhileAdding => "Remove during a slow connect fails the add and wins",
            ScenarioId::ProximityArrival => "Active trackable reaches its destination, near resolution applied",
            ScenarioId::LowBattery => "Battery drops to 10%, desired interval doubles",
            ScenarioId::SubscriberChurn => "Subscriber requests drive the engine resolution",
            ScenarioId::FatalChannel => "Channel reports failure, trackable fails and goes quiet",
            ScenarioId::StopTimeout => "Stop with a hanging connect times out, second stop succeeds",
        }
    }

    /// Returns true if the scenario injects transport faults.
    pub fn is_faulty(&self) -> bool {
        matches!(
            self,
            ScenarioId::FlakyNetwork | ScenarioId::FatalChannel | ScenarioId::StopTimeout
        )
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
            "steady_trip" | "steadytrip" | "trk-001" => Ok(ScenarioId::SteadyTrip),
            "flaky_network" | "flakynetwork" | "trk-002" => Ok(ScenarioId::FlakyNetwork),
            "duplicate_adds" | "duplicateadds" | "trk-003" => Ok(ScenarioId::DuplicateAdds),
            "remove_while_adding" | "removewhileadding" | "trk-004" => Ok(ScenarioId::RemoveWhileAdding),
            "proximity_arrival" | "proximityarrival" | "trk-005" => Ok(ScenarioId::ProximityArrival),
            "low_battery" | "lowbattery" | "trk-006" => Ok(ScenarioId::LowBattery),
            "subscriber_churn" | "subscriberchurn" | "trk-007" => Ok(ScenarioId::SubscriberChurn),
            "fatal_channel" | "fatalchannel" | "trk-008" => Ok(ScenarioId::FatalChannel),
            "stop_timeout" | "stoptimeout" | "trk-009" => Ok(ScenarioId::StopTimeout),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!("TRK-002".parse::<ScenarioId>(), Ok(ScenarioId::FlakyNetwork));
        assert_eq!("lowbattery".parse::<ScenarioId>(), Ok(ScenarioId::LowBattery));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
