//! Capture session lifecycle against fake microphone, secrets and recognizer.

mod common;

use avatar_voice::capture::MAX_RECORDING_TIME;
use avatar_voice::secrets::{SPEECH_KEY, SPEECH_REGION};
use avatar_voice::{
    CaptureConfig, CaptureSessionManager, CaptureState, RecognitionEvent, VoiceError,
};
use common::{
    init_tracing, FakeMicrophone, FakeRecognizerFactory, FakeSecretSource, FakeTimerDisplay,
    FakeUsageReporter,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    manager: CaptureSessionManager,
    microphone: Arc<FakeMicrophone>,
    secrets: Arc<FakeSecretSource>,
    factory: Arc<FakeRecognizerFactory>,
    usage: Arc<FakeUsageReporter>,
}

fn harness(
    microphone: Arc<FakeMicrophone>,
    secrets: Arc<FakeSecretSource>,
    factory: Arc<FakeRecognizerFactory>,
) -> Harness {
    let usage = FakeUsageReporter::new();
    let manager = CaptureSessionManager::new(
        CaptureConfig::default(),
        microphone.clone(),
        secrets.clone(),
        factory.clone(),
        usage.clone(),
    );
    Harness {
        manager,
        microphone,
        secrets,
        factory,
        usage,
    }
}

fn happy() -> Harness {
    harness(
        FakeMicrophone::allowing(),
        FakeSecretSource::valid(),
        FakeRecognizerFactory::new("hello world"),
    )
}

#[tokio::test(start_paused = true)]
async fn test_listen_and_stop_reports_rounded_duration() {
    init_tracing();
    let h = happy();
    assert_eq!(h.manager.state(), CaptureState::Uninitialized);

    assert_ok!(h.manager.request_microphone_permission().await);
    assert!(h.manager.has_permission());
    assert_ok!(h.manager.start_listening().await);
    assert_eq!(h.manager.state(), CaptureState::Listening);
    assert!(h.manager.session().recording_start.is_some());

    let credentials = h.factory.credentials.lock().clone().unwrap();
    assert_eq!(credentials.region, format!("value-of-{}", SPEECH_REGION));
    assert_eq!(credentials.key, format!("value-of-{}", SPEECH_KEY));
    assert_eq!(h.secrets.calls.lock().clone(), vec![SPEECH_REGION, SPEECH_KEY]);

    let recognizer = h.factory.recognizer();
    recognizer.emit(RecognitionEvent::Recognizing("hel".to_string()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.transcript().display(), "hel");

    tokio::time::sleep(Duration::from_millis(3400)).await;
    assert_eq!(h.manager.stop_listening().await.unwrap(), Some(4));

    assert_eq!(h.manager.state(), CaptureState::Ready);
    assert_eq!(h.manager.transcript().text, "hello world ");
    assert!(h.manager.transcript().partial.is_empty());
    assert_eq!(h.usage.reports(), vec![4]);
    assert_eq!(recognizer.starts.load(Ordering::SeqCst), 1);
    assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recording_is_capped_at_two_minutes() {
    init_tracing();
    let h = happy();
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.start_listening().await.unwrap();

    tokio::time::sleep(MAX_RECORDING_TIME + Duration::from_secs(1)).await;

    assert_eq!(h.manager.state(), CaptureState::Ready);
    assert_eq!(h.usage.reports(), vec![120]);
    assert_eq!(h.manager.transcript().text, "hello world ");
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_idle_reports_nothing() {
    init_tracing();
    let h = happy();
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.initialize().await.unwrap();

    assert_eq!(h.manager.stop_listening().await.unwrap(), None);
    assert!(h.usage.reports().is_empty());
    assert_eq!(h.manager.state(), CaptureState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_final_result_after_grace_is_ignored() {
    init_tracing();
    let h = harness(
        FakeMicrophone::allowing(),
        FakeSecretSource::valid(),
        FakeRecognizerFactory::new(""),
    );
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.start_listening().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // No final result arrives, so stopping waits out the grace period.
    let start = tokio::time::Instant::now();
    assert_eq!(h.manager.stop_listening().await.unwrap(), Some(2));
    assert_eq!(start.elapsed(), Duration::from_millis(3000));

    h.factory
        .recognizer()
        .emit(RecognitionEvent::Recognized("too late".to_string()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.transcript().text, "");
}

#[tokio::test(start_paused = true)]
async fn test_secret_retrieval_retries_then_succeeds() {
    init_tracing();
    let h = happy();
    h.secrets.script(
        SPEECH_REGION,
        vec![Err(VoiceError::Network("HTTP 502".to_string()))],
    );
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.initialize().await.unwrap();

    assert_eq!(h.secrets.calls_for(SPEECH_REGION), 2);
    assert_eq!(h.secrets.calls_for(SPEECH_KEY), 1);
    assert!(h.manager.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn test_secret_exhaustion_is_fatal() {
    init_tracing();
    let h = harness(
        FakeMicrophone::allowing(),
        FakeSecretSource::failing(),
        FakeRecognizerFactory::new("hello"),
    );
    h.manager.request_microphone_permission().await.unwrap();

    let err = h.manager.initialize().await.unwrap_err();
    assert!(matches!(err, VoiceError::RetriesExhausted { attempts: 3, .. }));
    assert!(err.is_fatal());
    assert_eq!(h.secrets.calls_for(SPEECH_REGION), 3);
    assert_eq!(h.factory.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.state(), CaptureState::ShutDown);
    assert_eq!(h.microphone.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_is_not_retried() {
    init_tracing();
    let h = harness(
        FakeMicrophone::allowing(),
        FakeSecretSource::rate_limited(),
        FakeRecognizerFactory::new("hello"),
    );
    h.manager.request_microphone_permission().await.unwrap();

    let err = h.manager.start_listening().await.unwrap_err();
    assert!(matches!(err, VoiceError::RateLimited(_)));
    assert!(err.is_fatal());
    assert_eq!(h.secrets.calls.lock().len(), 1);
    assert_eq!(h.manager.state(), CaptureState::ShutDown);
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_construction_is_retried() {
    init_tracing();
    let h = harness(
        FakeMicrophone::allowing(),
        FakeSecretSource::valid(),
        FakeRecognizerFactory::flaky("hello", 2),
    );
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.initialize().await.unwrap();
    assert_eq!(h.factory.attempts.load(Ordering::SeqCst), 3);

    // Already ready: no second construction.
    h.manager.initialize().await.unwrap();
    assert_eq!(h.factory.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_construction_gives_up() {
    init_tracing();
    let h = harness(
        FakeMicrophone::allowing(),
        FakeSecretSource::valid(),
        FakeRecognizerFactory::flaky("hello", 5),
    );
    h.manager.request_microphone_permission().await.unwrap();

    let err = h.manager.initialize().await.unwrap_err();
    assert!(matches!(err, VoiceError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(h.manager.state(), CaptureState::ShutDown);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_is_not_fatal() {
    init_tracing();
    let h = harness(
        FakeMicrophone::denying(),
        FakeSecretSource::valid(),
        FakeRecognizerFactory::new("hello"),
    );

    let err = assert_err!(h.manager.request_microphone_permission().await);
    assert!(matches!(err, VoiceError::PermissionDenied(_)));
    assert!(!err.is_fatal());
    assert!(!h.manager.has_permission());
    assert_eq!(h.manager.state(), CaptureState::PermissionPending);

    let err = h.manager.start_listening().await.unwrap_err();
    assert!(matches!(err, VoiceError::PermissionDenied(_)));
    assert!(h.secrets.calls.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_terminal_and_idempotent() {
    init_tracing();
    let h = happy();
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.start_listening().await.unwrap();
    let recognizer = h.factory.recognizer();

    assert!(h.manager.shutdown().await);
    assert!(!h.manager.shutdown().await);
    assert_eq!(h.manager.state(), CaptureState::ShutDown);
    assert_eq!(recognizer.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.microphone.releases.load(Ordering::SeqCst), 1);

    assert!(matches!(
        h.manager.start_listening().await,
        Err(VoiceError::ShutDown)
    ));
    assert!(matches!(
        h.manager.request_microphone_permission().await,
        Err(VoiceError::ShutDown)
    ));

    // The cap timer died with the session.
    tokio::time::sleep(MAX_RECORDING_TIME * 2).await;
    assert!(h.usage.reports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_countdown_updates_display_and_stops_listening() {
    init_tracing();
    let h = happy();
    let display = Arc::new(FakeTimerDisplay::default());
    h.manager.set_timer_display(display.clone());
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.start_listening().await.unwrap();

    h.manager.start_timer(Duration::from_secs(5));
    assert!(h.manager.is_timer_running());
    // A second start while running is ignored.
    h.manager.start_timer(Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(display.shown.lock().clone(), vec![4, 3, 2, 1]);
    assert!(display.clears.load(Ordering::SeqCst) >= 1);
    assert!(!h.manager.is_timer_running());
    assert_eq!(h.manager.state(), CaptureState::Ready);
    assert_eq!(h.usage.reports(), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_timer_clears_display() {
    init_tracing();
    let h = happy();
    let display = Arc::new(FakeTimerDisplay::default());
    h.manager.set_timer_display(display.clone());

    h.manager.start_timer(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    h.manager.stop_timer();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(display.shown.lock().clone(), vec![29, 28]);
    assert_eq!(display.clears.load(Ordering::SeqCst), 1);
    assert!(!h.manager.is_timer_running());
}

#[tokio::test(start_paused = true)]
async fn test_start_while_stopping_is_rejected() {
    init_tracing();
    let h = harness(
        FakeMicrophone::allowing(),
        FakeSecretSource::valid(),
        FakeRecognizerFactory::new(""),
    );
    h.manager.request_microphone_permission().await.unwrap();
    h.manager.start_listening().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    // No final result, so the stop sits in its grace period.
    let stopping = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.stop_listening().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.state(), CaptureState::Stopping);

    let err = h.manager.start_listening().await.unwrap_err();
    assert!(matches!(err, VoiceError::Recognizer(_)));
    assert_eq!(h.factory.recognizer().starts.load(Ordering::SeqCst), 1);

    assert_eq!(stopping.await.unwrap().unwrap(), Some(1));
    assert_eq!(h.manager.state(), CaptureState::Ready);
    assert_ok!(h.manager.start_listening().await);
    assert_eq!(h.manager.state(), CaptureState::Listening);
    assert_eq!(h.factory.recognizer().starts.load(Ordering::SeqCst), 2);
}
