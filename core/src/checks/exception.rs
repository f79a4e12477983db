use super::{CheckContext, CheckError, EXCEPTION_RAISED};
use crate::core::signal::Signal;
use crate::http::TransportErrorKind;

/// Turns a transport failure into a signal tagged by its class.
pub fn exception_raised(ctx: &CheckContext<'_>) -> Result<Option<Signal>, CheckError> {
    let Some(error) = ctx.transport_error() else {
        return Ok(None);
    };

    let (slug, tags): (String, Vec<&str>) = match &error.kind {
        TransportErrorKind::Timeout => (
            "CONNECTION_TIMEOUT".to_string(),
            vec!["CONNECTION_TIMEOUT", "SERVER_FAIL"],
        ),
        TransportErrorKind::InvalidRequest => (
            "INVALID_REQUEST".to_string(),
            vec!["INVALID_REQUEST", "CLIENT_FAIL"],
        ),
        TransportErrorKind::Connection => ("CONNECTION_FAIL".to_string(), vec!["CONNECTION_FAIL"]),
        TransportErrorKind::Other(class) => (
            format!("{}_{}", EXCEPTION_RAISED, class.to_ascii_uppercase()),
            vec![EXCEPTION_RAISED],
        ),
    };

    Ok(Some(
        Signal::new(EXCEPTION_RAISED, slug, error.to_string())
            .with_tags(tags)
            .with_data("class", error.kind.to_string())
            .with_data("message", error.message.as_str()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::fixtures::*;
    use crate::checks::Thresholds;
    use crate::http::TransportError;

    fn signal_for(kind: TransportErrorKind) -> Signal {
        let t = Thresholds::default();
        let init = observed(response(200, "", 1));
        let test = failed(TransportError::new(kind, "boom"));
        let ctx = CheckContext::new(&init, &t).with_variant(&test, "p");
        exception_raised(&ctx).unwrap().unwrap()
    }

    #[test]
    fn test_timeout() {
        let signal = signal_for(TransportErrorKind::Timeout);
        assert_eq!(signal.slug, "CONNECTION_TIMEOUT");
        assert!(signal.tags.contains("SERVER_FAIL"));
    }

    #[test]
    fn test_invalid_request_and_connection() {
        let invalid = signal_for(TransportErrorKind::InvalidRequest);
        assert!(invalid.tags.contains("CLIENT_FAIL"));
        assert!(invalid.tags.contains("INVALID_REQUEST"));

        let conn = signal_for(TransportErrorKind::Connection);
        assert_eq!(conn.tags.len(), 1);
        assert!(conn.tags.contains("CONNECTION_FAIL"));
    }

    #[test]
    fn test_generic_error_carries_class_name() {
        let signal = signal_for(TransportErrorKind::Other("DecodeError".to_string()));
        assert_eq!(signal.slug, "EXCEPTION_RAISED_DECODEERROR");
        assert!(signal.tags.contains(EXCEPTION_RAISED));
        assert_eq!(signal.data["class"], "DecodeError");
        assert_eq!(signal.data["message"], "boom");
    }

    #[test]
    fn test_no_error_no_signal() {
        let t = Thresholds::default();
        let init = observed(response(200, "", 1));
        assert!(exception_raised(&CheckContext::new(&init, &t)).unwrap().is_none());
    }
}
