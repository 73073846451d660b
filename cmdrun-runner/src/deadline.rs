use cmdrun_core::{Action, ActionCallback, CmdrunError, Result, SignalSpec, TimeoutSpec};
use nix::sys::signal::Signal;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Offsets are clamped to this; anything longer never fires in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A resolved escalation action
#[derive(Clone)]
pub enum Escalation {
    Signal(Signal),
    /// Signal 0: checks the pid, delivers nothing
    Probe,
    Callback(ActionCallback),
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escalation::Signal(signal) => f.debug_tuple("Signal").field(signal).finish(),
            Escalation::Probe => f.write_str("Probe"),
            Escalation::Callback(_) => f.write_str("Callback(<fn>)"),
        }
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escalation::Signal(signal) => write!(f, "{}", signal.as_str()),
            Escalation::Probe => write!(f, "0"),
            Escalation::Callback(_) => write!(f, "callback"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadlinePoint {
    pub fire_at: Instant,
    /// Offset from the start of the run, clamped to FAR_FUTURE
    pub offset: Duration,
    pub escalation: Escalation,
}

/// Deadline points of one run, in the order they fire
#[derive(Debug, Clone, Default)]
pub struct DeadlineSequence {
    points: Vec<DeadlinePoint>,
}

impl DeadlineSequence {
    /// Resolve a timeout spec against the run's start instant.
    ///
    /// No spec means no points: the supervisor waits for exit without bound.
    /// Points with equal deadlines keep the order they were given in.
    pub fn build(spec: Option<&TimeoutSpec>, started: Instant) -> Result<Self> {
        let mut points = match spec {
            None => Vec::new(),
            Some(TimeoutSpec::After(secs)) => {
                vec![point(started, *secs, Escalation::Signal(Signal::SIGKILL))?]
            }
            Some(TimeoutSpec::Steps(steps)) => steps
                .iter()
                .map(|step| {
                    let escalation = resolve_action(&step.action)?;
                    point(started, step.after, escalation)
                })
                .collect::<Result<Vec<_>>>()?,
        };

        points.sort_by_key(|p| p.fire_at);

        Ok(Self { points })
    }

    pub fn is_unbounded(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeadlinePoint> {
        self.points.iter()
    }
}

impl IntoIterator for DeadlineSequence {
    type Item = DeadlinePoint;
    type IntoIter = std::vec::IntoIter<DeadlinePoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

fn point(started: Instant, secs: f64, escalation: Escalation) -> Result<DeadlinePoint> {
    let invalid = || {
        CmdrunError::InvalidTimeoutSpec(format!(
            "Unsupported timeout value '{}'. Must be a non-negative number of seconds",
            secs
        ))
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid());
    }

    let offset =
        Duration::try_from_secs_f64(secs.min(FAR_FUTURE.as_secs_f64())).map_err(|_| invalid())?;

    Ok(DeadlinePoint {
        fire_at: started + offset,
        offset,
        escalation,
    })
}

fn resolve_action(action: &Action) -> Result<Escalation> {
    match action {
        Action::Signal(spec) => resolve_signal(spec),
        Action::Callback(callback) => Ok(Escalation::Callback(callback.clone())),
        Action::Terminal => Ok(Escalation::Signal(Signal::SIGKILL)),
    }
}

/// Resolve a signal name (`TERM`, `sigterm`, `"15"`) or number.
pub fn resolve_signal(spec: &SignalSpec) -> Result<Escalation> {
    match spec {
        SignalSpec::Number(number) => signal_from_number(*number),
        SignalSpec::Name(name) => {
            let name = name.trim();
            if let Ok(number) = name.parse::<i32>() {
                return signal_from_number(number);
            }

            let upper = name.to_ascii_uppercase();
            let full = if upper.starts_with("SIG") {
                upper
            } else {
                format!("SIG{}", upper)
            };

            Signal::from_str(&full).map(Escalation::Signal).map_err(|_| {
                CmdrunError::InvalidTimeoutSpec(format!("Unsupported signal '{}'", name))
            })
        }
    }
}

fn signal_from_number(number: i32) -> Result<Escalation> {
    if number == 0 {
        return Ok(Escalation::Probe);
    }

    Signal::try_from(number).map(Escalation::Signal).map_err(|_| {
        CmdrunError::InvalidTimeoutSpec(format!("Unsupported signal number {}", number))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(sequence: &DeadlineSequence) -> Vec<String> {
        sequence.iter().map(|p| p.escalation.to_string()).collect()
    }

    #[test]
    fn test_no_spec_is_unbounded() {
        let sequence = DeadlineSequence::build(None, Instant::now()).unwrap();
        assert!(sequence.is_unbounded());
        assert_eq!(sequence.len(), 0);
    }

    #[test]
    fn test_bare_timeout_kills() {
        let started = Instant::now();
        let spec = TimeoutSpec::after_secs(2.0);
        let sequence = DeadlineSequence::build(Some(&spec), started).unwrap();

        assert_eq!(sequence.len(), 1);
        let point = sequence.iter().next().unwrap();
        assert_eq!(point.fire_at, started + Duration::from_secs(2));
        assert!(matches!(point.escalation, Escalation::Signal(Signal::SIGKILL)));
    }

    #[test]
    fn test_steps_sorted_by_deadline() {
        let spec = TimeoutSpec::escalate([
            (6.0, Action::callback(|_| Ok(()))),
            (1.0, Action::signal("HUP")),
            (3.0, Action::signal(15)),
            (5.0, Action::Terminal),
            (2.0, Action::signal("sigint")),
        ]);
        let sequence = DeadlineSequence::build(Some(&spec), Instant::now()).unwrap();

        assert_eq!(
            signals(&sequence),
            vec!["SIGHUP", "SIGINT", "SIGTERM", "SIGKILL", "callback"]
        );
        let offsets: Vec<u64> = sequence.iter().map(|p| p.offset.as_secs()).collect();
        assert_eq!(offsets, vec![1, 2, 3, 5, 6]);
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let spec = TimeoutSpec::escalate([
            (1.0, Action::signal("USR1")),
            (1.0, Action::signal("TERM")),
            (0.5, Action::signal("HUP")),
            (1.0, Action::signal("USR2")),
        ]);
        let sequence = DeadlineSequence::build(Some(&spec), Instant::now()).unwrap();

        assert_eq!(
            signals(&sequence),
            vec!["SIGHUP", "SIGUSR1", "SIGTERM", "SIGUSR2"]
        );
    }

    #[test]
    fn test_signal_zero_is_probe() {
        assert!(matches!(
            resolve_signal(&SignalSpec::Number(0)).unwrap(),
            Escalation::Probe
        ));
        assert!(matches!(
            resolve_signal(&SignalSpec::from("0")).unwrap(),
            Escalation::Probe
        ));
    }

    #[test]
    fn test_signal_names_resolve() {
        assert!(matches!(
            resolve_signal(&SignalSpec::from("KILL")).unwrap(),
            Escalation::Signal(Signal::SIGKILL)
        ));
        assert!(matches!(
            resolve_signal(&SignalSpec::from("SIGTERM")).unwrap(),
            Escalation::Signal(Signal::SIGTERM)
        ));
        assert!(matches!(
            resolve_signal(&SignalSpec::from(" term ")).unwrap(),
            Escalation::Signal(Signal::SIGTERM)
        ));
        assert!(matches!(
            resolve_signal(&SignalSpec::from("9")).unwrap(),
            Escalation::Signal(Signal::SIGKILL)
        ));
    }

    #[test]
    fn test_invalid_durations_rejected() {
        for secs in [-1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let spec = TimeoutSpec::after_secs(secs);
            let err = DeadlineSequence::build(Some(&spec), Instant::now()).unwrap_err();
            assert!(matches!(err, CmdrunError::InvalidTimeoutSpec(_)), "{}", secs);
        }

        let spec = TimeoutSpec::escalate([(1.0, Action::signal("TERM")), (-2.0, Action::Terminal)]);
        assert!(matches!(
            DeadlineSequence::build(Some(&spec), Instant::now()),
            Err(CmdrunError::InvalidTimeoutSpec(_))
        ));
    }

    #[test]
    fn test_invalid_signals_rejected() {
        for spec in [
            TimeoutSpec::escalate([(1.0, Action::signal("NOPE"))]),
            TimeoutSpec::escalate([(1.0, Action::signal(4096))]),
            TimeoutSpec::escalate([(1.0, Action::signal(""))]),
        ] {
            let err = DeadlineSequence::build(Some(&spec), Instant::now()).unwrap_err();
            assert!(matches!(err, CmdrunError::InvalidTimeoutSpec(_)));
        }
    }

    #[test]
    fn test_huge_offset_clamped() {
        let started = Instant::now();
        for secs in [1.0e15, 1.0e20, f64::MAX] {
            let spec = TimeoutSpec::after_secs(secs);
            let sequence = DeadlineSequence::build(Some(&spec), started).unwrap();
            let point = sequence.iter().next().unwrap();
            assert_eq!(point.fire_at, started + FAR_FUTURE);
            assert_eq!(point.offset, FAR_FUTURE);
        }
    }
}
