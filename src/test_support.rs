//! Step-recording assertions for tests.
//!
//! A [`TestReport`] keeps a log of the setup, actions and checks a test
//! went through. When the test panics the log is printed to stderr, so a
//! failing proxy test shows the traffic it saw along with the assertion.

use std::fmt::{Debug, Display};
use std::sync::Mutex;

/// Start a report named after the enclosing test function.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = name.strip_suffix("::f").unwrap_or(name);
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::test_support::TestReport::new(name, $title, file!(), line!())
    }};
}

const MAX_SHOWN: usize = 1000;

pub struct TestReport {
    test: String,
    title: String,
    location: String,
    steps: Mutex<Vec<String>>,
}

impl TestReport {
    pub fn new(test: &str, title: &str, file: &str, line: u32) -> Self {
        Self {
            test: test.to_string(),
            title: title.to_string(),
            location: format!("{}:{}", file, line),
            steps: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, line: String) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(line);
        }
    }

    fn shown(value: &impl Debug) -> String {
        let s = format!("{:?}", value);
        if s.len() <= MAX_SHOWN {
            s
        } else {
            let mut end = MAX_SHOWN;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... ({} bytes)", &s[..end], s.len())
        }
    }

    pub fn setup(&self, msg: impl Display) {
        self.record(format!("setup: {}", msg));
    }

    pub fn action(&self, msg: impl Display) {
        self.record(format!("action: {}", msg));
    }

    pub fn output(&self, label: &str, text: &str) {
        self.record(format!("output {}: {}", label, Self::shown(&text)));
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        self.record(format!(
            "check {}: {} == {}",
            label,
            Self::shown(actual),
            Self::shown(expected)
        ));
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        self.record(format!(
            "check {}: {} contains {:?}",
            label,
            Self::shown(&haystack),
            needle
        ));
        assert!(
            haystack.contains(needle),
            "{}: {:?} does not contain {:?}",
            label,
            haystack,
            needle
        );
    }

    pub fn assert_starts_with(&self, label: &str, value: &str, prefix: &str) {
        self.record(format!(
            "check {}: {} starts with {:?}",
            label,
            Self::shown(&value),
            prefix
        ));
        assert!(
            value.starts_with(prefix),
            "{}: {:?} does not start with {:?}",
            label,
            value,
            prefix
        );
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.record(format!("check {}: {}", label, value));
        assert!(value, "{}", label);
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let steps = match self.steps.lock() {
            Ok(steps) => steps.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        eprintln!("--- {} ({}) at {}", self.test, self.title, self.location);
        for (i, step) in steps.iter().enumerate() {
            eprintln!("{:>3}. {}", i + 1, step);
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_name_detected() {
        let t = test_report!("Report is named after the test function");
        t.assert_true("name", t.test.ends_with("test_support::tests::test_name_detected"));
        let recorded = t.steps.lock().unwrap().len();
        t.assert_eq("steps recorded", &recorded, &1usize);
    }

    #[test]
    fn test_long_values_truncated() {
        let t = test_report!("Long values are cut in the step log");
        let long = "x".repeat(5000);
        t.output("long", &long);
        let steps = t.steps.lock().unwrap().clone();
        t.assert_contains("marker", &steps[0], "(5002 bytes)");
    }
}
