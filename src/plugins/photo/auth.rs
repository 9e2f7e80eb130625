use crate::core::connectivity::{ensure_connected, ConnectivityProbe, Service};
use crate::core::error::DownloadError;
use crate::plugins::photo::api::{PhotoApi, PhotoApiError, PhotoPost, PhotoSession};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MAX_LOGIN_ATTEMPTS: usize = 3;
pub const LOGIN_WINDOW: Duration = Duration::from_secs(600);

#[derive(Default)]
struct AuthState {
    session: Option<PhotoSession>,
    attempts: VecDeque<Instant>,
}

/// Owns the photo network session for the lifetime of the process.
///
/// Login attempts are throttled to [`MAX_LOGIN_ATTEMPTS`] per [`LOGIN_WINDOW`],
/// counted whether or not they succeed.
pub struct AuthenticationManager {
    api: Arc<dyn PhotoApi>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    state: Mutex<AuthState>,
    max_attempts: usize,
    window: Duration,
}

impl AuthenticationManager {
    pub fn new(api: Arc<dyn PhotoApi>) -> Self {
        Self {
            api,
            probe: None,
            state: Mutex::new(AuthState::default()),
            max_attempts: MAX_LOGIN_ATTEMPTS,
            window: LOGIN_WINDOW,
        }
    }

    /// Checks reachability before each login attempt.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_throttle(mut self, max_attempts: usize, window: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.window = window;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().session.is_some()
    }

    pub fn session(&self) -> Option<PhotoSession> {
        self.state.lock().session.clone()
    }

    pub fn logout(&self) {
        if self.state.lock().session.take().is_some() {
            tracing::info!("photo network session cleared");
        }
    }

    /// Reserves an attempt slot or reports how long until one frees up.
    fn reserve_attempt(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut st = self.state.lock();
        while st.attempts.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            st.attempts.pop_front();
        }
        if st.attempts.len() >= self.max_attempts {
            let oldest = st.attempts.front().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.duration_since(oldest)));
        }
        st.attempts.push_back(now);
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), DownloadError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(DownloadError::AuthenticationRequired("username and password are required".to_string()));
        }
        if let Err(wait) = self.reserve_attempt() {
            let minutes = wait.as_secs().div_ceil(60).max(1);
            return Err(DownloadError::AuthenticationRequired(format!(
                "too many login attempts, try again in {} minute(s)",
                minutes
            )));
        }
        if let Some(probe) = &self.probe {
            ensure_connected(probe.as_ref(), Service::PhotoNetwork).await?;
        }

        match self.api.login(username, password).await {
            Ok(session) => {
                self.state.lock().session = Some(session);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(username, error = %e, "photo network login failed");
                Err(DownloadError::AuthenticationRequired(format!("login failed: {}", e)))
            }
        }
    }

    /// Fetches post metadata with the current session. An expired session is dropped.
    pub async fn fetch_post(&self, shortcode: &str) -> Result<PhotoPost, DownloadError> {
        let session = self
            .session()
            .ok_or_else(|| DownloadError::AuthenticationRequired("log in to the photo network first".to_string()))?;
        match self.api.fetch_post(&session, shortcode).await {
            Ok(post) => Ok(post),
            Err(PhotoApiError::Unauthorized) => {
                self.logout();
                Err(DownloadError::AuthenticationRequired("session expired, log in again".to_string()))
            }
            Err(e) => Err(DownloadError::other(format!("fetching post {}: {}", shortcode, e))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugins::photo::api::{MediaNode, PostMedia};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts the password "pw" and serves one fixed post.
    #[derive(Default)]
    pub struct FakeApi {
        pub logins: AtomicUsize,
        pub fetches: AtomicUsize,
        pub post: Mutex<Option<PhotoPost>>,
        pub expired: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl PhotoApi for FakeApi {
        async fn login(&self, username: &str, password: &str) -> Result<PhotoSession, PhotoApiError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if password != "pw" {
                return Err(PhotoApiError::BadCredentials("nope".into()));
            }
            Ok(PhotoSession { username: username.into(), session_id: "s".into(), csrf_token: "t".into() })
        }

        async fn fetch_post(&self, _session: &PhotoSession, shortcode: &str) -> Result<PhotoPost, PhotoApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.expired.load(Ordering::SeqCst) {
                return Err(PhotoApiError::Unauthorized);
            }
            self.post.lock().clone().ok_or_else(|| PhotoApiError::NotFound(shortcode.into()))
        }
    }

    fn single_post() -> PhotoPost {
        PhotoPost {
            shortcode: "abc".into(),
            caption: None,
            media: PostMedia::Single(MediaNode { is_video: false, url: "http://x/a.jpg".into() }),
        }
    }

    #[tokio::test]
    async fn login_sets_session() {
        let api = Arc::new(FakeApi::default());
        let auth = AuthenticationManager::new(api.clone());
        assert!(!auth.is_authenticated());
        auth.login("alice", "pw").await.unwrap();
        assert!(auth.is_authenticated());
        assert_eq!(auth.session().unwrap().username, "alice");
        auth.logout();
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn throttles_after_three_attempts() {
        let api = Arc::new(FakeApi::default());
        let auth = AuthenticationManager::new(api.clone());
        for _ in 0..3 {
            assert!(auth.login("alice", "bad").await.is_err());
        }
        let err = auth.login("alice", "pw").await.unwrap_err();
        assert!(err.to_string().contains("too many login attempts"), "{err}");
        assert_eq!(api.logins.load(Ordering::SeqCst), 3);
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn attempts_expire_after_window() {
        let api = Arc::new(FakeApi::default());
        let auth = AuthenticationManager::new(api.clone()).with_throttle(1, Duration::from_millis(20));
        assert!(auth.login("alice", "bad").await.is_err());
        assert!(auth.login("alice", "pw").await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        auth.login("alice", "pw").await.unwrap();
    }

    #[tokio::test]
    async fn empty_credentials_do_not_count() {
        let api = Arc::new(FakeApi::default());
        let auth = AuthenticationManager::new(api.clone()).with_throttle(1, LOGIN_WINDOW);
        assert!(auth.login("", "pw").await.is_err());
        auth.login("alice", "pw").await.unwrap();
        assert_eq!(api.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_session_logs_out() {
        let api = Arc::new(FakeApi::default());
        *api.post.lock() = Some(single_post());
        let auth = AuthenticationManager::new(api.clone());
        auth.login("alice", "pw").await.unwrap();
        assert!(auth.fetch_post("abc").await.is_ok());

        api.expired.store(true, Ordering::SeqCst);
        let err = auth.fetch_post("abc").await.unwrap_err();
        assert!(matches!(err, DownloadError::AuthenticationRequired(_)));
        assert!(!auth.is_authenticated());
    }
}
