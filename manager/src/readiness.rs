//! Expected-device countdown and timeout reporting

use std::collections::HashSet;

/// Outcome of recording one announced device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStep {
    /// Name was already counted
    Duplicate,
    /// Still waiting for this many devices
    Waiting(i64),
    /// Every expected device has appeared
    Ready,
}

/// Counts announced devices down to zero.
///
/// Each distinct name counts once, so readiness depends only on which devices appeared,
/// never on the order they were announced in.
#[derive(Debug, Clone, Default)]
pub struct DeviceCountdown {
    expected: i64,
    remaining: i64,
    seen: HashSet<String>,
}

impl DeviceCountdown {
    pub fn new(expected: usize) -> Self {
        let expected = i64::try_from(expected).unwrap_or(i64::MAX);
        Self {
            expected,
            remaining: expected,
            seen: HashSet::new(),
        }
    }

    pub fn expected(&self) -> i64 {
        self.expected
    }

    /// May go negative when drivers announce more devices than requested
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn is_ready(&self) -> bool {
        self.remaining <= 0
    }

    pub fn has_seen(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    pub fn record(&mut self, name: &str) -> CountdownStep {
        if !self.seen.insert(name.to_string()) {
            return CountdownStep::Duplicate;
        }
        self.remaining -= 1;
        if self.is_ready() {
            CountdownStep::Ready
        } else {
            CountdownStep::Waiting(self.remaining)
        }
    }
}

/// Labels of local drivers that produced no device
pub fn missing_local<'a>(drivers: impl IntoIterator<Item = (&'a str, usize)>) -> Vec<String> {
    drivers
        .into_iter()
        .filter(|(_, devices)| *devices == 0)
        .map(|(label, _)| label.to_string())
        .collect()
}

/// Profile drivers whose name matches no announced device's driver name
pub fn missing_remote(profile_drivers: &[String], device_driver_names: &[String]) -> Vec<String> {
    profile_drivers
        .iter()
        .filter(|driver| !device_driver_names.contains(driver))
        .cloned()
        .collect()
}

/// User-facing message listing devices that never appeared
pub fn timeout_report(missing: &[String], remote: bool) -> String {
    let list = missing
        .iter()
        .map(|name| format!("+ {}", name))
        .collect::<Vec<_>>()
        .join("\n");
    let verb = if remote {
        "Unable to remotely establish"
    } else {
        "Unable to establish"
    };

    if missing.len() == 1 {
        format!(
            "{}:\n{}\nPlease ensure the device is connected and powered on.",
            verb, list
        )
    } else {
        format!(
            "{} the following devices:\n{}\nPlease ensure each device is connected and powered on.",
            verb, list
        )
    }
}

/// Message for devices that were announced but never connected
pub fn connection_report(disconnected: &[String]) -> String {
    match disconnected {
        [single] => format!(
            "Failed to connect to {}. Please ensure device is connected and powered on.",
            single
        ),
        many => format!(
            "Failed to connect to \n{}\nPlease ensure each device is connected and powered on.",
            many.join("\n")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permutations(items: &[&'static str]) -> Vec<Vec<&'static str>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_readiness_is_order_independent() {
        let names = ["Telescope Simulator", "CCD Simulator", "Focuser Simulator", "Dome Simulator"];
        for order in permutations(&names) {
            let mut countdown = DeviceCountdown::new(names.len());
            for (i, name) in order.iter().enumerate() {
                let step = countdown.record(name);
                if i + 1 == names.len() {
                    assert_eq!(step, CountdownStep::Ready, "order {:?}", order);
                } else {
                    assert!(!countdown.is_ready(), "order {:?}", order);
                }
            }
            assert_eq!(countdown.remaining(), 0);
        }
    }

    #[test]
    fn test_duplicates_do_not_count() {
        let mut countdown = DeviceCountdown::new(2);
        assert_eq!(countdown.record("CCD Simulator"), CountdownStep::Waiting(1));
        assert_eq!(countdown.record("CCD Simulator"), CountdownStep::Duplicate);
        assert!(!countdown.is_ready());
        assert_eq!(countdown.record("Guide Simulator"), CountdownStep::Ready);
        assert!(countdown.has_seen("Guide Simulator"));
    }

    #[test]
    fn test_report_names_exactly_the_missing_devices() {
        let drivers = [
            ("Telescope Simulator", 1),
            ("CCD Simulator", 0),
            ("Focuser Simulator", 2),
            ("Dome Simulator", 0),
        ];
        let missing = missing_local(drivers.iter().copied());
        assert_eq!(missing, vec!["CCD Simulator", "Dome Simulator"]);

        let report = timeout_report(&missing, false);
        assert!(report.starts_with("Unable to establish the following devices:"));
        let listed: Vec<&str> = report.lines().filter(|l| l.starts_with("+ ")).collect();
        assert_eq!(listed, vec!["+ CCD Simulator", "+ Dome Simulator"]);

        let single = timeout_report(&missing[..1], false);
        assert_eq!(
            single,
            "Unable to establish:\n+ CCD Simulator\nPlease ensure the device is connected and powered on."
        );
    }

    #[test]
    fn test_remote_missing_compares_driver_names() {
        let profile = vec!["Telescope Simulator".to_string(), "CCD Simulator".to_string()];
        let seen = vec!["Telescope Simulator".to_string()];
        let missing = missing_remote(&profile, &seen);
        assert_eq!(missing, vec!["CCD Simulator"]);
        assert!(timeout_report(&missing, true).starts_with("Unable to remotely establish:"));
    }

    #[test]
    fn test_connection_report() {
        assert_eq!(
            connection_report(&["CCD Simulator".to_string()]),
            "Failed to connect to CCD Simulator. Please ensure device is connected and powered on."
        );
        assert!(connection_report(&["A".to_string(), "B".to_string()]).contains("A\nB"));
    }
}
