use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::keys::new_survey_id;
use crate::ports::BoxFuture;
use crate::ports::accounts::{AccountDirectory, AccountError};
use crate::ports::posts::{PostError, PostPublisher};
use crate::survey::SurveyConfig;

#[derive(Default)]
struct PublisherState {
    posts: Vec<(String, String)>,
    failing: HashSet<String>,
}

/// Records created posts instead of calling the host platform.
#[derive(Clone, Default)]
pub struct InMemoryPostPublisher {
    inner: Arc<Mutex<PublisherState>>,
}

impl InMemoryPostPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later post for `survey_id` fail until [`Self::recover`].
    pub fn fail_for(&self, survey_id: &str) {
        let mut guard = self.inner.lock().expect("publisher lock");
        guard.failing.insert(survey_id.to_string());
    }

    pub fn recover(&self, survey_id: &str) {
        let mut guard = self.inner.lock().expect("publisher lock");
        guard.failing.remove(survey_id);
    }

    /// `(survey_id, post_id)` pairs in creation order.
    pub fn posts(&self) -> Vec<(String, String)> {
        let guard = self.inner.lock().expect("publisher lock");
        guard.posts.clone()
    }

    pub fn post_count(&self, survey_id: &str) -> usize {
        let guard = self.inner.lock().expect("publisher lock");
        guard
            .posts
            .iter()
            .filter(|(survey, _)| survey == survey_id)
            .count()
    }
}

impl PostPublisher for InMemoryPostPublisher {
    fn create_survey_post(&self, survey: &SurveyConfig) -> BoxFuture<'_, Result<String, PostError>> {
        let survey_id = survey.id.clone();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("publisher lock");
            if guard.failing.contains(&survey_id) {
                return Err(PostError::Unavailable(format!(
                    "post for {survey_id} refused"
                )));
            }
            let post_id = format!("t3_{}", &new_survey_id()[3..]);
            guard.posts.push((survey_id, post_id.clone()));
            Ok(post_id)
        })
    }
}

/// Account directory backed by a set of known user ids. Every other id is
/// reported missing unless the directory assumes everyone is present.
#[derive(Clone, Default)]
pub struct InMemoryAccountDirectory {
    known: Arc<Mutex<HashSet<String>>>,
    lookups: Arc<Mutex<Vec<String>>>,
    assume_present: bool,
}

impl InMemoryAccountDirectory {
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: Arc::new(Mutex::new(known.into_iter().map(Into::into).collect())),
            lookups: Arc::default(),
            assume_present: false,
        }
    }

    /// Reports every account as present. Used when no host platform is
    /// configured, so the liveness sweep never retires data.
    pub fn assume_all_present() -> Self {
        Self {
            assume_present: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, user_id: &str) {
        let mut guard = self.known.lock().expect("directory lock");
        guard.insert(user_id.to_string());
    }

    pub fn remove(&self, user_id: &str) {
        let mut guard = self.known.lock().expect("directory lock");
        guard.remove(user_id);
    }

    /// User ids looked up so far, in order.
    pub fn lookups(&self) -> Vec<String> {
        let guard = self.lookups.lock().expect("directory lock");
        guard.clone()
    }
}

impl AccountDirectory for InMemoryAccountDirectory {
    fn account_exists(&self, user_id: &str) -> BoxFuture<'_, Result<bool, AccountError>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let exists = {
                let guard = self.known.lock().expect("directory lock");
                self.assume_present || guard.contains(&user_id)
            };
            let mut lookups = self.lookups.lock().expect("directory lock");
            lookups.push(user_id);
            Ok(exists)
        })
    }
}
