use std::collections::HashMap;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::access;
use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{Company, Document, DocumentImage, NewDocument, NewDocumentImage};
use crate::schema::{companies, document_images, documents, users};
use crate::state::AppState;
use crate::storage::public_object_url;

const DATE_FORMAT: &str = "%Y-%m-%d";
const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const DEFAULT_EXTENSION: &str = "bin";

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub truck_number: Option<String>,
    pub date: Option<NaiveDate>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Serialize)]
pub struct DocumentImageResponse {
    pub id: Uuid,
    pub image_url: String,
    pub s3_key: String,
    pub file_size: i64,
    pub uploaded_at: String,
}

impl From<DocumentImage> for DocumentImageResponse {
    fn from(image: DocumentImage) -> Self {
        Self {
            id: image.id,
            image_url: image.image_url,
            s3_key: image.s3_key,
            file_size: image.file_size,
            uploaded_at: to_iso(image.uploaded_at),
        }
    }
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub company: Uuid,
    pub company_name: String,
    pub uploaded_by: Option<Uuid>,
    pub uploaded_by_name: Option<String>,
    pub truck_number: String,
    pub date: String,
    pub images: Vec<DocumentImageResponse>,
    pub created_at: String,
    pub updated_at: String,
}

struct UploadedFile {
    bytes: Vec<u8>,
    file_name: String,
    content_type: Option<String>,
}

pub async fn upload_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let company_id = access::require_company(&user)?;

    let mut truck_number: Option<String> = None;
    let mut date_raw: Option<String> = None;
    let mut files: Vec<UploadedFile> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("truck_number") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid truck number: {err}")))?;
                truck_number = Some(value);
            }
            Some("date") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid date: {err}")))?;
                date_raw = Some(value);
            }
            Some("images") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, file_name = %file_name, "failed to read image bytes");
                    AppError::bad_request(format!("failed to read image bytes: {err}"))
                })?;
                files.push(UploadedFile {
                    bytes: data.to_vec(),
                    file_name,
                    content_type,
                });
            }
            _ => {}
        }
    }

    let truck_number = truck_number
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("truck number is required"))?;

    let date_raw = date_raw
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::bad_request("date is required"))?;
    let date = NaiveDate::parse_from_str(date_raw, DATE_FORMAT)
        .map_err(|_| AppError::bad_request("date must be in YYYY-MM-DD format"))?;

    if files.is_empty() {
        return Err(AppError::bad_request("at least one image is required"));
    }

    let max_files = state.config.max_files_per_upload;
    if files.len() > max_files {
        return Err(AppError::bad_request(format!(
            "maximum {max_files} files allowed"
        )));
    }

    let max_bytes = state.config.max_file_size_bytes;
    for file in &files {
        if file.bytes.len() as u64 > max_bytes {
            return Err(AppError::bad_request(format!(
                "file {} exceeds maximum size of {max_bytes} bytes",
                file.file_name
            )));
        }
    }

    let document = match store_document(&state, &user, company_id, truck_number, date, files).await
    {
        Ok(document) => {
            info!(
                document_id = %document.id,
                company_id = %company_id,
                image_count = document.images.len(),
                "document upload succeeded"
            );
            document
        }
        Err(err) => {
            error!(error = ?err, company_id = %company_id, "document upload failed");
            return Err(err);
        }
    };

    Ok((StatusCode::CREATED, Json(document)))
}

/// Persists the document header first, then uploads each file and records
/// its metadata. The header commit is the rollback anchor: on any per-file
/// failure the header row is removed (cascading the image rows) and every
/// object stored during this attempt is deleted best effort.
async fn store_document(
    state: &AppState,
    user: &AuthenticatedUser,
    company_id: Uuid,
    truck_number: String,
    date: NaiveDate,
    files: Vec<UploadedFile>,
) -> AppResult<DocumentResponse> {
    let document_id = Uuid::new_v4();
    let new_document = NewDocument {
        id: document_id,
        company_id,
        uploaded_by: Some(user.user_id),
        truck_number: truck_number.clone(),
        date,
    };

    {
        let mut conn = state.db()?;
        diesel::insert_into(documents::table)
            .values(&new_document)
            .execute(&mut conn)?;
    }

    let mut stored_keys: Vec<String> = Vec::with_capacity(files.len());

    for file in files {
        let s3_key = generate_object_key(company_id, &truck_number, date, &file.file_name);
        let content_type = file.content_type.clone().or_else(|| {
            mime_guess::from_path(&file.file_name)
                .first_raw()
                .map(str::to_string)
        });
        let file_size = file.bytes.len() as i64;

        let result = state
            .storage
            .put_object(&s3_key, file.bytes, content_type)
            .await;

        if let Err(err) = result {
            rollback_upload(state, document_id, &stored_keys).await;
            return Err(AppError::internal(format!("upload failed: {err}")));
        }
        stored_keys.push(s3_key.clone());

        let new_image = NewDocumentImage {
            id: Uuid::new_v4(),
            document_id,
            image_url: public_object_url(&state.config.s3_bucket, &state.config.aws_region, &s3_key),
            s3_key,
            file_size,
        };

        let persisted = state.db().and_then(|mut conn| {
            diesel::insert_into(document_images::table)
                .values(&new_image)
                .execute(&mut conn)
                .map_err(AppError::from)
        });

        if let Err(err) = persisted {
            rollback_upload(state, document_id, &stored_keys).await;
            return Err(AppError::internal(format!("upload failed: {err}")));
        }
    }

    let mut conn = state.db()?;
    let document: Document = documents::table.find(document_id).first(&mut conn)?;
    let images: Vec<DocumentImage> = document_images::table
        .filter(document_images::document_id.eq(document_id))
        .order(document_images::uploaded_at.asc())
        .load(&mut conn)?;
    let company: Company = companies::table.find(company_id).first(&mut conn)?;

    Ok(to_document_response(
        document,
        company.name,
        Some(user.username.clone()),
        images.into_iter().map(DocumentImageResponse::from).collect(),
    ))
}

/// Compensating actions for a failed upload: drain the undo stack of
/// already-stored objects, then drop the header row. Individual object
/// deletions may fail against a degraded store; those are logged and the
/// relational cleanup proceeds regardless.
async fn rollback_upload(state: &AppState, document_id: Uuid, stored_keys: &[String]) {
    for key in stored_keys {
        if let Err(err) = state.storage.delete_object(key).await {
            warn!(key = %key, error = %err, "failed to delete object during upload rollback");
        }
    }

    match state.db() {
        Ok(mut conn) => {
            if let Err(err) = diesel::delete(documents::table.find(document_id)).execute(&mut conn)
            {
                error!(document_id = %document_id, error = %err, "failed to delete document during upload rollback");
            }
        }
        Err(err) => {
            error!(document_id = %document_id, error = ?err, "failed to acquire connection during upload rollback");
        }
    }
}

/// Second-granularity timestamp plus an 8-character random token. A
/// collision would need the same company, truck, date, second and token.
fn generate_object_key(
    company_id: Uuid,
    truck_number: &str,
    date: NaiveDate,
    file_name: &str,
) -> String {
    let timestamp = Utc::now().format(KEY_TIMESTAMP_FORMAT);
    let token = &Uuid::new_v4().simple().to_string()[..8];
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
        .unwrap_or(DEFAULT_EXTENSION);
    format!("companies/{company_id}/documents/{truck_number}/{date}/{timestamp}_{token}.{extension}")
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<DocumentListQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let Some(company_id) = user.company_id else {
        return Ok(Json(vec![]));
    };

    let mut conn = state.db()?;

    let mut docs_query = documents::table
        .filter(documents::company_id.eq(company_id))
        .into_boxed();

    if let Some(truck_number) = params
        .truck_number
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        let escaped = truck_number
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        docs_query = docs_query.filter(documents::truck_number.ilike(pattern));
    }
    if let Some(date) = params.date {
        docs_query = docs_query.filter(documents::date.eq(date));
    }
    if let Some(date_from) = params.date_from {
        docs_query = docs_query.filter(documents::date.ge(date_from));
    }
    if let Some(date_to) = params.date_to {
        docs_query = docs_query.filter(documents::date.le(date_to));
    }

    let docs: Vec<Document> = docs_query
        .order(documents::created_at.desc())
        .load(&mut conn)?;

    let company: Company = companies::table.find(company_id).first(&mut conn)?;
    let doc_ids: Vec<Uuid> = docs.iter().map(|doc| doc.id).collect();
    let mut images_map = load_images_for_documents(&mut conn, &doc_ids)?;
    let uploader_names = load_uploader_names(&mut conn, &docs)?;

    let response = docs
        .into_iter()
        .map(|doc| {
            let images = images_map.remove(&doc.id).unwrap_or_default();
            let uploader = doc
                .uploaded_by
                .and_then(|id| uploader_names.get(&id).cloned());
            to_document_response(doc, company.name.clone(), uploader, images)
        })
        .collect();

    Ok(Json(response))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentResponse>> {
    let company_id = access::require_company(&user)?;

    let mut conn = state.db()?;
    let doc = find_company_document(&mut conn, company_id, document_id)?;
    access::ensure_same_company(&user, Some(doc.company_id))?;

    let company: Company = companies::table.find(company_id).first(&mut conn)?;
    let mut images_map = load_images_for_documents(&mut conn, &[doc.id])?;
    let uploader_names = load_uploader_names(&mut conn, std::slice::from_ref(&doc))?;
    let uploader = doc
        .uploaded_by
        .and_then(|id| uploader_names.get(&id).cloned());
    let images = images_map.remove(&doc.id).unwrap_or_default();

    Ok(Json(to_document_response(doc, company.name, uploader, images)))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let company_id = access::require_company(&user)?;

    let mut conn = state.db()?;
    let doc = find_company_document(&mut conn, company_id, document_id)?;
    access::ensure_same_company(&user, Some(doc.company_id))?;

    let images: Vec<DocumentImage> = document_images::table
        .filter(document_images::document_id.eq(doc.id))
        .load(&mut conn)?;
    drop(conn);

    // Best-effort cleanup: a degraded object store never blocks the
    // relational delete.
    for image in &images {
        if let Err(err) = state.storage.delete_object(&image.s3_key).await {
            warn!(key = %image.s3_key, error = %err, "failed to delete object for removed document");
        }
    }

    let mut conn = state.db()?;
    diesel::delete(documents::table.find(doc.id)).execute(&mut conn)?;

    info!(document_id = %doc.id, company_id = %company_id, "document deleted");
    Ok(Json(json!({ "message": "document deleted successfully" })))
}

fn find_company_document(
    conn: &mut PgConnection,
    company_id: Uuid,
    document_id: Uuid,
) -> AppResult<Document> {
    documents::table
        .filter(documents::id.eq(document_id))
        .filter(documents::company_id.eq(company_id))
        .first(conn)
        .map_err(AppError::from)
}

fn load_images_for_documents(
    conn: &mut PgConnection,
    document_ids: &[Uuid],
) -> AppResult<HashMap<Uuid, Vec<DocumentImageResponse>>> {
    if document_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<DocumentImage> = document_images::table
        .filter(document_images::document_id.eq_any(document_ids))
        .order(document_images::uploaded_at.asc())
        .load(conn)?;

    let mut map: HashMap<Uuid, Vec<DocumentImageResponse>> = HashMap::new();
    for image in rows {
        map.entry(image.document_id)
            .or_default()
            .push(DocumentImageResponse::from(image));
    }
    Ok(map)
}

fn load_uploader_names(
    conn: &mut PgConnection,
    docs: &[Document],
) -> AppResult<HashMap<Uuid, String>> {
    let mut uploader_ids: Vec<Uuid> = docs.iter().filter_map(|doc| doc.uploaded_by).collect();
    uploader_ids.sort();
    uploader_ids.dedup();

    if uploader_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(Uuid, String)> = users::table
        .filter(users::id.eq_any(&uploader_ids))
        .select((users::id, users::username))
        .load(conn)?;

    Ok(rows.into_iter().collect())
}

fn to_document_response(
    doc: Document,
    company_name: String,
    uploaded_by_name: Option<String>,
    images: Vec<DocumentImageResponse>,
) -> DocumentResponse {
    DocumentResponse {
        id: doc.id,
        company: doc.company_id,
        company_name,
        uploaded_by: doc.uploaded_by,
        uploaded_by_name,
        truck_number: doc.truck_number,
        date: doc.date.format(DATE_FORMAT).to_string(),
        images,
        created_at: to_iso(doc.created_at),
        updated_at: to_iso(doc.updated_at),
    }
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}
