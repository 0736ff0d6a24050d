use chrono::Utc;

use tpar::scheduler::job::{ExitCode, Job, JobRequest, JobState, OutputSink};
use tpar::scheduler::matcher::{JobMatch, ParseError, StateMatch};

fn job(id: u64, name: &str, state: JobState) -> Job {
    Job {
        id,
        request: JobRequest {
            name: name.to_string(),
            command: "true".to_string(),
            ..Default::default()
        },
        sink: OutputSink::Discard,
        state,
    }
}

fn queued() -> JobState {
    JobState::queued_now()
}

fn finished() -> JobState {
    JobState::Finished {
        exit: ExitCode::Success,
        finished_at: Utc::now(),
    }
}

#[test]
fn test_parse_atoms() {
    assert_eq!(JobMatch::parse("all").unwrap(), JobMatch::All);
    assert_eq!(JobMatch::parse("id:42").unwrap(), JobMatch::Id(42));
    assert_eq!(
        JobMatch::parse("name:build-*").unwrap(),
        JobMatch::Name("build-*".to_string())
    );
    assert_eq!(
        JobMatch::parse("state:queued").unwrap(),
        JobMatch::State(StateMatch::Queued)
    );
}

#[test]
fn test_parse_errors() {
    assert_eq!(JobMatch::parse(""), Err(ParseError::UnexpectedEnd));
    assert_eq!(JobMatch::parse("(id:1"), Err(ParseError::UnbalancedParen));
    assert_eq!(JobMatch::parse("id:1)"), Err(ParseError::TrailingInput));
    assert_eq!(JobMatch::parse("id:x"), Err(ParseError::BadId));
    assert_eq!(JobMatch::parse("state:bogus"), Err(ParseError::BadState));
    assert_eq!(JobMatch::parse("bogus"), Err(ParseError::BadToken));
    assert_eq!(JobMatch::parse("id:1 id:2"), Err(ParseError::TrailingInput));
    assert_eq!(JobMatch::parse("id:1 and"), Err(ParseError::UnexpectedEnd));
}

#[test]
fn test_not_binds_tighter_than_and_tighter_than_or() {
    // Parsed as: (id:1 and (not id:2)) or id:3
    let matcher = JobMatch::parse("id:1 and not id:2 or id:3").unwrap();
    assert!(matcher.matches(&job(1, "a", queued())));
    assert!(matcher.matches(&job(3, "a", queued())));
    assert!(!matcher.matches(&job(2, "a", queued())));
    assert!(!matcher.matches(&job(4, "a", queued())));
}

#[test]
fn test_parens_override_precedence() {
    let matcher = JobMatch::parse("(state:queued or state:finished) and name:web-?").unwrap();
    assert!(matcher.matches(&job(0, "web-1", queued())));
    assert!(matcher.matches(&job(1, "web-2", finished())));
    assert!(!matcher.matches(&job(2, "web-10", queued())));
    assert!(!matcher.matches(&job(
        3,
        "web-1",
        JobState::Failed {
            reason: "x".to_string(),
            failed_at: Utc::now(),
        }
    )));
}

#[test]
fn test_id_match() {
    let matcher = JobMatch::parse("id:7").unwrap();
    assert!(matcher.matches(&job(7, "a", queued())));
    assert!(!matcher.matches(&job(8, "a", queued())));
}

#[test]
fn test_state_match_covers_all_states() {
    let running = JobState::Running {
        worker: 0,
        started_at: Utc::now(),
    };
    let killed = JobState::Killed {
        killed_at: Utc::now(),
    };

    assert!(JobMatch::parse("state:running")
        .unwrap()
        .matches(&job(0, "a", running)));
    assert!(JobMatch::parse("state:killed")
        .unwrap()
        .matches(&job(0, "a", killed)));
    assert!(JobMatch::parse("state:finished")
        .unwrap()
        .matches(&job(0, "a", finished())));
    assert!(!JobMatch::parse("state:queued")
        .unwrap()
        .matches(&job(0, "a", finished())));
}

#[test]
fn test_name_glob() {
    let cases = [
        ("*", "anything", true),
        ("*", "", true),
        ("build-*", "build-web", true),
        ("build-*", "build-", true),
        ("build-*", "deploy-web", false),
        ("*-web", "build-web", true),
        ("a?c", "abc", true),
        ("a?c", "ac", false),
        ("*middle*", "has middle here", true),
        ("exact", "exact", true),
        ("exact", "exactly", false),
    ];
    for (glob, name, expected) in cases {
        let matcher = JobMatch::Name(glob.to_string());
        assert_eq!(
            matcher.matches(&job(0, name, queued())),
            expected,
            "glob {glob:?} against {name:?}"
        );
    }
}

#[test]
fn test_not_all_matches_nothing() {
    let matcher = JobMatch::parse("not all").unwrap();
    assert!(!matcher.matches(&job(0, "a", queued())));
}
