use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use fleetdocs::auth::jwt::JwtService;
use fleetdocs::auth::password::hash_password;
use fleetdocs::config::AppConfig;
use fleetdocs::db::{self, PgPool};
use fleetdocs::models::{NewCompany, NewUser};
use fleetdocs::routes;
use fleetdocs::routes::users::derive_username;
use fleetdocs::state::AppState;
use fleetdocs::storage::ObjectStorage;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[allow(dead_code)]
#[derive(Clone)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
    deleted_keys: Mutex<Vec<String>>,
    puts_before_failure: Mutex<Option<usize>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        {
            let mut remaining = self.puts_before_failure.lock().await;
            if let Some(count) = remaining.as_mut() {
                if *count == 0 {
                    bail!("injected store failure for {key}");
                }
                *count -= 1;
            }
        }

        let stored = StoredObject {
            key: key.to_string(),
            bytes,
            content_type,
        };
        let mut guard = self.objects.lock().await;
        guard.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        self.deleted_keys.lock().await.push(key.to_string());
        Ok(())
    }
}

impl FakeStorage {
    /// Allows `count` successful puts, then fails every later one.
    #[allow(dead_code)]
    pub async fn fail_puts_after(&self, count: usize) {
        *self.puts_before_failure.lock().await = Some(count);
    }

    #[allow(dead_code)]
    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        let guard = self.objects.lock().await;
        guard.get(key).cloned()
    }

    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }

    #[allow(dead_code)]
    pub async fn deleted_keys(&self) -> Vec<String> {
        self.deleted_keys.lock().await.clone()
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_limits(10, 5 * 1024 * 1024).await
    }

    pub async fn with_limits(max_files_per_upload: usize, max_file_size_bytes: u64) -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            refresh_token_expiry_days: 30,
            cors_allowed_origin: None,
            aws_endpoint_url: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".to_string(),
            s3_bucket: "test-bucket".to_string(),
            max_files_per_upload,
            max_file_size_bytes,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool.clone(), config, storage_for_state, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    pub async fn insert_company(&self, name: &str) -> Result<Uuid> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let company = NewCompany {
                id: Uuid::new_v4(),
                name,
                is_active: true,
            };
            diesel::insert_into(fleetdocs::schema::companies::table)
                .values(&company)
                .execute(conn)
                .context("failed to insert company")?;
            Ok(company.id)
        })
        .await
    }

    pub async fn insert_user(
        &self,
        mobile: &str,
        password: &str,
        role: &str,
        company: Option<(Uuid, &str)>,
    ) -> Result<Uuid> {
        let mobile = mobile.to_string();
        let password = password.to_string();
        let role = role.to_string();
        let company_id = company.map(|(id, _)| id);
        let username = match company {
            Some((_, name)) => derive_username(name, &mobile),
            None => mobile.clone(),
        };
        self.with_conn(move |conn| {
            let password_hash = hash_password(&password)?;
            let user = NewUser {
                id: Uuid::new_v4(),
                company_id,
                role,
                mobile,
                username,
                password_hash,
                is_active: true,
            };
            diesel::insert_into(fleetdocs::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    pub async fn deactivate_user_row(&self, user_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            use fleetdocs::schema::users::dsl;
            diesel::update(dsl::users.find(user_id))
                .set(dsl::is_active.eq(false))
                .execute(conn)
                .context("failed to deactivate user")?;
            Ok(())
        })
        .await
    }

    pub async fn user_is_active(&self, user_id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            use fleetdocs::schema::users::dsl;
            let active = dsl::users
                .find(user_id)
                .select(dsl::is_active)
                .first(conn)
                .context("failed to load user")?;
            Ok(active)
        })
        .await
    }

    pub async fn document_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            use diesel::dsl::count_star;
            let count = fleetdocs::schema::documents::table
                .select(count_star())
                .first(conn)
                .context("failed to count documents")?;
            Ok(count)
        })
        .await
    }

    pub async fn document_image_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            use diesel::dsl::count_star;
            let count = fleetdocs::schema::document_images::table
                .select(count_star())
                .first(conn)
                .context("failed to count document images")?;
            Ok(count)
        })
        .await
    }

    pub async fn login_tokens(&self, mobile: &str, password: &str) -> Result<(String, String)> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            mobile: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json("/api/auth/login", &LoginPayload { mobile, password }, None)
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = body_to_vec(response.into_body()).await?;
        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access: String,
            refresh: String,
        }
        let parsed: LoginResponse = serde_json::from_slice(&body)?;
        Ok((parsed.access, parsed.refresh))
    }

    pub async fn login_token(&self, mobile: &str, password: &str) -> Result<String> {
        let (access, _) = self.login_tokens(mobile, password).await?;
        Ok(access)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PATCH, path, payload, token).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    /// Builds the multipart form the upload endpoint expects:
    /// `truck_number`, `date` and any number of `images` parts.
    pub async fn upload_documents(
        &self,
        truck_number: Option<&str>,
        date: Option<&str>,
        images: &[(&str, &str, &[u8])],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();

        if let Some(truck_number) = truck_number {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"truck_number\"\r\n\r\n");
            body.extend(truck_number.as_bytes());
            body.extend(b"\r\n");
        }

        if let Some(date) = date {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"date\"\r\n\r\n");
            body.extend(date.as_bytes());
            body.extend(b"\r\n");
        }

        for (filename, content_type, data) in images {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!(
                    "Content-Disposition: form-data; name=\"images\"; filename=\"{filename}\"\r\n"
                )
                .as_bytes(),
            );
            body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
            body.extend(*data);
            body.extend(b"\r\n");
        }

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let builder = Request::builder()
            .method(Method::POST)
            .uri("/api/documents/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"));

        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE refresh_tokens, document_images, documents, users, companies RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
