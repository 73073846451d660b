use crate::grammar::{Rule, TimeoutParser};
use cmdrun_core::{Action, CmdrunError, Result, SignalSpec, TimeoutSpec, TimeoutStep};
use pest::Parser;

/// Parse a textual timeout spec into a TimeoutSpec.
///
/// A bare duration (`"5"`, `"2.5"`, `"500ms"`, `"2m"`) kills the child once it
/// elapses. A comma separated list of `duration:signal` pairs
/// (`"2:TERM, 5:KILL"`) escalates through the given signals.
pub fn parse_timeout_spec(input: &str) -> Result<TimeoutSpec> {
    let mut pairs = TimeoutParser::parse(Rule::spec, input).map_err(|e| {
        CmdrunError::ParseError(format!("Invalid timeout spec '{}': {}", input, e))
    })?;

    let spec_pair = pairs.next().ok_or_else(|| {
        CmdrunError::ParseError(format!("Empty timeout spec '{}'", input))
    })?;

    for inner_pair in spec_pair.into_inner() {
        match inner_pair.as_rule() {
            Rule::duration => return Ok(TimeoutSpec::After(parse_duration(inner_pair)?)),
            Rule::steps => return parse_steps(inner_pair),
            _ => {}
        }
    }

    Err(CmdrunError::ParseError(format!(
        "Empty timeout spec '{}'",
        input
    )))
}

fn parse_steps(pair: pest::iterators::Pair<Rule>) -> Result<TimeoutSpec> {
    let mut steps = Vec::new();

    for inner_pair in pair.into_inner() {
        if inner_pair.as_rule() == Rule::step {
            steps.push(parse_step(inner_pair)?);
        }
    }

    Ok(TimeoutSpec::Steps(steps))
}

fn parse_step(pair: pest::iterators::Pair<Rule>) -> Result<TimeoutStep> {
    let mut after = None;
    let mut signal = None;

    for inner_pair in pair.into_inner() {
        match inner_pair.as_rule() {
            Rule::duration => after = Some(parse_duration(inner_pair)?),
            Rule::signal => signal = Some(parse_signal(inner_pair.as_str())),
            _ => {}
        }
    }

    match (after, signal) {
        (Some(after), Some(signal)) => Ok(TimeoutStep {
            after,
            action: Action::Signal(signal),
        }),
        _ => Err(CmdrunError::ParseError(
            "Timeout step needs both a duration and a signal".to_string(),
        )),
    }
}

fn parse_duration(pair: pest::iterators::Pair<Rule>) -> Result<f64> {
    let mut value = 0.0;
    let mut scale = 1.0;

    for inner_pair in pair.into_inner() {
        match inner_pair.as_rule() {
            Rule::number => {
                value = inner_pair.as_str().parse::<f64>().map_err(|e| {
                    CmdrunError::ParseError(format!(
                        "Invalid duration '{}': {}",
                        inner_pair.as_str(),
                        e
                    ))
                })?;
            }
            Rule::unit => {
                scale = match inner_pair.as_str() {
                    "ms" => 0.001,
                    "m" => 60.0,
                    "h" => 3600.0,
                    _ => 1.0,
                };
            }
            _ => {}
        }
    }

    Ok(value * scale)
}

fn parse_signal(text: &str) -> SignalSpec {
    match text.parse::<i32>() {
        Ok(number) => SignalSpec::Number(number),
        Err(_) => SignalSpec::Name(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps_of(spec: TimeoutSpec) -> Vec<TimeoutStep> {
        match spec {
            TimeoutSpec::Steps(steps) => steps,
            other => panic!("expected steps, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_seconds() {
        let spec = parse_timeout_spec("5").unwrap();
        assert!(matches!(spec, TimeoutSpec::After(secs) if secs == 5.0));
    }

    #[test]
    fn test_parse_units() {
        assert!(matches!(parse_timeout_spec("2.5").unwrap(), TimeoutSpec::After(s) if s == 2.5));
        assert!(matches!(parse_timeout_spec("500ms").unwrap(), TimeoutSpec::After(s) if (s - 0.5).abs() < 1e-9));
        assert!(matches!(parse_timeout_spec("2m").unwrap(), TimeoutSpec::After(s) if s == 120.0));
        assert!(matches!(parse_timeout_spec("1h").unwrap(), TimeoutSpec::After(s) if s == 3600.0));
        assert!(matches!(parse_timeout_spec(" 3s ").unwrap(), TimeoutSpec::After(s) if s == 3.0));
    }

    #[test]
    fn test_parse_escalation_keeps_given_order() {
        let steps = steps_of(parse_timeout_spec("5:KILL, 2:TERM").unwrap());
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].after, 5.0);
        assert!(matches!(&steps[0].action, Action::Signal(SignalSpec::Name(n)) if n == "KILL"));
        assert_eq!(steps[1].after, 2.0);
        assert!(matches!(&steps[1].action, Action::Signal(SignalSpec::Name(n)) if n == "TERM"));
    }

    #[test]
    fn test_parse_numeric_signal_and_equals_separator() {
        let steps = steps_of(parse_timeout_spec("1=15,3=9").unwrap());
        assert!(matches!(steps[0].action, Action::Signal(SignalSpec::Number(15))));
        assert!(matches!(steps[1].action, Action::Signal(SignalSpec::Number(9))));
    }

    #[test]
    fn test_parse_invalid_syntax() {
        assert!(parse_timeout_spec("").is_err());
        assert!(parse_timeout_spec("soon").is_err());
        assert!(parse_timeout_spec("-1").is_err());
        assert!(parse_timeout_spec("2:").is_err());
        assert!(parse_timeout_spec("2:TERM,").is_err());
    }
}
