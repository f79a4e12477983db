use super::{CheckContext, CheckError, LENGTH_DIFF, LENGTH_OVER_MAX, TIME_DIFF, TIME_OVER_MAX};
use crate::core::signal::Signal;

/// Relative change from `base` to `test`, in percent. The `+ 1` keeps a
/// zero baseline from dividing by zero.
pub fn percent_diff(base: f64, test: f64) -> f64 {
    (test - base).abs() / (base + 1.0) * 100.0
}

fn diff_signal(check: &str, unit: &str, base: f64, test: f64, percent: f64) -> Signal {
    let diff = test - base;
    let direction = if diff > 0.0 { "OVER" } else { "UNDER" };
    Signal::new(
        check,
        format!("{}_{}", check, direction),
        format!(
            "{} changed by {:.0}% ({} -> {} {})",
            check, percent, base, test, unit
        ),
    )
    .with_data("base", base)
    .with_data("test", test)
    .with_data("diff", diff)
    .with_data("percent", percent)
}

/// Fires when the variant's response body grew or shrank by more than
/// the threshold and the change is not just the request size change
/// echoed back.
pub fn length_diff(ctx: &CheckContext<'_>) -> Result<Option<Signal>, CheckError> {
    let (Some(base_resp), Some(test_resp), Some(test_req)) =
        (ctx.init_response(), ctx.test_response(), ctx.test_request())
    else {
        return Ok(None);
    };

    let request_delta = test_req.wire_length() as i64 - ctx.init_request().wire_length() as i64;
    let response_delta = test_resp.body.len() as i64 - base_resp.body.len() as i64;
    if response_delta == request_delta {
        return Ok(None);
    }

    let base = base_resp.body.len() as f64;
    let test = test_resp.body.len() as f64;
    let percent = percent_diff(base, test);
    if percent <= ctx.thresholds().length_diff_percent {
        return Ok(None);
    }
    Ok(Some(
        diff_signal(LENGTH_DIFF, "bytes", base, test, percent)
            .with_data("request_delta", request_delta),
    ))
}

/// Same comparison over elapsed time, in seconds.
pub fn time_diff(ctx: &CheckContext<'_>) -> Result<Option<Signal>, CheckError> {
    let (Some(base_resp), Some(test_resp)) = (ctx.init_response(), ctx.test_response()) else {
        return Ok(None);
    };
    let base = base_resp.elapsed.as_secs_f64();
    let test = test_resp.elapsed.as_secs_f64();
    let percent = percent_diff(base, test);
    if percent <= ctx.thresholds().time_diff_percent {
        return Ok(None);
    }
    Ok(Some(diff_signal(TIME_DIFF, "s", base, test, percent)))
}

pub fn length_over_max(ctx: &CheckContext<'_>) -> Result<Option<Signal>, CheckError> {
    let Some(response) = ctx.response() else {
        return Ok(None);
    };
    let max = ctx.thresholds().max_length;
    if response.body.len() <= max {
        return Ok(None);
    }
    Ok(Some(
        Signal::new(
            LENGTH_OVER_MAX,
            LENGTH_OVER_MAX,
            format!("Response body is {} bytes, over the {} byte limit", response.body.len(), max),
        )
        .with_data("length", response.body.len())
        .with_data("max_length", max),
    ))
}

pub fn time_over_max(ctx: &CheckContext<'_>) -> Result<Option<Signal>, CheckError> {
    let Some(response) = ctx.response() else {
        return Ok(None);
    };
    let elapsed = response.elapsed.as_secs_f64();
    let max = ctx.thresholds().max_time;
    if elapsed <= max {
        return Ok(None);
    }
    Ok(Some(
        Signal::new(
            TIME_OVER_MAX,
            TIME_OVER_MAX,
            format!("Response took {:.2}s, over the {}s limit", elapsed, max),
        )
        .with_tags(["SLOW_RESPONSE"])
        .with_data("elapsed", elapsed)
        .with_data("max_time", max),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::fixtures::*;
    use crate::checks::{Observation, Thresholds};
    use crate::http::Body;

    fn thresholds(length: f64, time: f64) -> Thresholds {
        Thresholds {
            length_diff_percent: length,
            time_diff_percent: time,
            ..Thresholds::default()
        }
    }

    #[test]
    fn test_percent_formula_keeps_plus_one() {
        assert_eq!(percent_diff(0.0, 10.0), 1000.0);
        assert_eq!(percent_diff(99.0, 49.0), 50.0);
    }

    #[test]
    fn test_equal_lengths_never_fire() {
        let body = "x".repeat(100);
        let init = observed(response(200, &body, 1));
        let test = observed(response(200, &body, 1));
        for threshold in [-1.0, 0.0, 1000.0] {
            let t = thresholds(threshold, 1000.0);
            let ctx = CheckContext::new(&init, &t).with_variant(&test, "p");
            assert!(length_diff(&ctx).unwrap().is_none());
        }
    }

    #[test]
    fn test_length_diff_over_and_under() {
        let t = thresholds(50.0, 1000.0);
        let init = observed(response(200, &"x".repeat(100), 1));

        let big = observed(response(200, &"x".repeat(1000), 1));
        let ctx = CheckContext::new(&init, &t).with_variant(&big, "p");
        let signal = length_diff(&ctx).unwrap().unwrap();
        assert_eq!(signal.slug, "LENGTH_DIFF_OVER");

        let small = observed(response(200, "x", 1));
        let ctx = CheckContext::new(&init, &t).with_variant(&small, "p");
        assert_eq!(length_diff(&ctx).unwrap().unwrap().slug, "LENGTH_DIFF_UNDER");
    }

    #[test]
    fn test_length_change_explained_by_request() {
        let t = thresholds(1.0, 1000.0);
        let init = observed(response(200, "ab", 1));

        let mut grown = request();
        grown.body = Body::Raw("x".repeat(20));
        let test = Observation::new(grown, Ok(response(200, &"ab".repeat(11), 1)));

        let ctx = CheckContext::new(&init, &t).with_variant(&test, "p");
        assert!(length_diff(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_length_diff_needs_variant() {
        let t = thresholds(0.0, 0.0);
        let init = observed(response(200, "abc", 1));
        assert!(length_diff(&CheckContext::new(&init, &t)).unwrap().is_none());
        assert!(time_diff(&CheckContext::new(&init, &t)).unwrap().is_none());
    }

    #[test]
    fn test_time_diff() {
        let t = thresholds(1000.0, 100.0);
        let init = observed(response(200, "", 100));
        let slow = observed(response(200, "", 5_000));
        let ctx = CheckContext::new(&init, &t).with_variant(&slow, "' OR SLEEP(5)--");
        assert_eq!(time_diff(&ctx).unwrap().unwrap().slug, "TIME_DIFF_OVER");

        let same = observed(response(200, "", 150));
        let ctx = CheckContext::new(&init, &t).with_variant(&same, "x");
        assert!(time_diff(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_absolute_limits() {
        let t = Thresholds {
            max_length: 10,
            max_time: 1.0,
            ..Thresholds::default()
        };
        let init = observed(response(200, &"y".repeat(11), 1_500));
        let ctx = CheckContext::new(&init, &t);
        assert_eq!(length_over_max(&ctx).unwrap().unwrap().slug, LENGTH_OVER_MAX);
        assert!(time_over_max(&ctx).unwrap().unwrap().tags.contains("SLOW_RESPONSE"));

        let init = observed(response(200, "short", 10));
        let ctx = CheckContext::new(&init, &t);
        assert!(length_over_max(&ctx).unwrap().is_none());
        assert!(time_over_max(&ctx).unwrap().is_none());
    }
}
