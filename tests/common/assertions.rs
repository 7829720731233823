//! Custom assertion macros

/// Assert that a result is ok and return the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that an event list holds exactly `count` events matching a pattern
#[macro_export]
macro_rules! assert_event_count {
    ($events:expr, $pattern:pat, $count:expr) => {
        let matching = $events.iter().filter(|e| matches!(e, $pattern)).count();
        assert_eq!(
            matching,
            $count,
            "expected {} matching events, got {}: {:?}",
            $count,
            matching,
            $events
        );
    };
}
