use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use reqwest::header::{ACCEPT_ENCODING, RANGE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio_util::io::StreamReader;

pub use reqwest::{Client, IntoUrl};
pub use url::Url;

use super::*;

pub const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com/";

/// A [`Bucket`] talking to a JSON object API over HTTP.
///
/// Objects are read through `alt=media` downloads with a `Range` header, so that a block download only
/// transfers its own byte range. Bodies are streamed, never buffered as a whole.
///
/// _Note: requests are sent unauthenticated; use [`HttpBucket::with_client()`] to plug in a client adding
/// credentials._
#[derive(Debug, Clone)]
pub struct HttpBucket {
    client: Client,
    base_url: Url,
    name: String,
}

impl HttpBucket {
    pub fn new(base_url: impl IntoUrl, name: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            client: Client::default(),
            base_url: base_url.into_url()?,
            name: name.into(),
        })
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    /// `{base}/storage/v1/b/{bucket}/o`
    fn objects_url(&self) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["storage", "v1", "b", &self.name, "o"]);
        Ok(url)
    }

    /// `{base}/storage/v1/b/{bucket}/o/{object}`, with the object name as a single escaped segment.
    fn object_url(&self, object: &str, generation: i64) -> Result<Url, Error> {
        let mut url = self.objects_url()?;
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(object);
        if generation != 0 {
            url.query_pairs_mut().append_pair("generation", &generation.to_string());
        }
        Ok(url)
    }

    fn check(resp: Response, name: &str) -> Result<Response, Error> {
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound { name: name.to_owned() }),
            status if status.is_success() => Ok(resp),
            status => Err(Error::Status {
                status,
                url: resp.url().clone(),
            }),
        }
    }
}

/// Inclusive HTTP range for a half-open byte range, `None` when empty.
fn range_header(range: &ByteRange) -> Option<String> {
    (!range.is_empty()).then(|| format!("bytes={}-{}", range.start, range.limit - 1))
}

#[async_trait]
impl Bucket for HttpBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_reader_with_read_handle(&self, req: ReadObjectRequest) -> Result<ObjectReader, Error> {
        let mut url = self.object_url(&req.name, req.generation)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let mut builder = self.client.get(url);

        if let Some(range) = req.range {
            match range_header(&range) {
                Some(value) => builder = builder.header(RANGE, value),
                None => return Ok(ObjectReader::new(tokio::io::empty())),
            }
        }
        if req.read_compressed {
            builder = builder.header(ACCEPT_ENCODING, "gzip");
        }

        let resp = Self::check(builder.send().await?, &req.name)?;
        let stream = resp.bytes_stream().map_err(io::Error::other);

        Ok(ObjectReader::new(StreamReader::new(stream)))
    }

    async fn delete_object(&self, req: DeleteObjectRequest) -> Result<(), Error> {
        let url = self.object_url(&req.name, req.generation)?;

        Self::check(self.client.delete(url).send().await?, &req.name)?;

        Ok(())
    }

    async fn list_objects(&self, req: ListObjectsRequest) -> Result<Listing, Error> {
        let mut url = self.objects_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", &req.prefix);
            if let Some(ref token) = req.continuation_token {
                query.append_pair("pageToken", token);
            }
            if let Some(max_results) = req.max_results {
                query.append_pair("maxResults", &max_results.to_string());
            }
        }

        let resp = Self::check(self.client.get(url).send().await?, &self.name)?;
        let page: ObjectsPage = serde_json::from_slice(&resp.bytes().await?)?;

        page.try_into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectsPage {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

// int64 fields are encoded as JSON strings
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    size: String,
    generation: String,
    updated: DateTime<Utc>,
    content_encoding: Option<String>,
}

impl TryFrom<ObjectResource> for MinObject {
    type Error = Error;

    fn try_from(o: ObjectResource) -> Result<Self, Self::Error> {
        let size = o
            .size
            .parse()
            .map_err(|_| Error::InvalidMetadata(format!("size {:?} of {:?}", o.size, o.name)))?;
        let generation = o
            .generation
            .parse()
            .map_err(|_| Error::InvalidMetadata(format!("generation {:?} of {:?}", o.generation, o.name)))?;

        Ok(MinObject {
            name: o.name,
            size,
            generation,
            updated: o.updated,
            content_encoding: o.content_encoding,
        })
    }
}

impl TryFrom<ObjectsPage> for Listing {
    type Error = Error;

    fn try_from(page: ObjectsPage) -> Result<Self, Self::Error> {
        Ok(Listing {
            min_objects: page.items.into_iter().map(MinObject::try_from).collect::<Result<_, _>>()?,
            continuation_token: page.next_page_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn bucket() -> HttpBucket {
        HttpBucket::new(DEFAULT_BASE_URL, "my-bucket").unwrap()
    }

    #[test]
    fn test_object_url_escapes_name() {
        let url = bucket().object_url("tmp/.objfs_tmp/a b", 42).unwrap();

        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/my-bucket/o/tmp%2F.objfs_tmp%2Fa%20b?generation=42"
        );
    }

    #[test]
    fn test_object_url_latest_generation() {
        let url = HttpBucket::new("http://localhost:9000/prefix/", "b").unwrap().object_url("o", 0).unwrap();

        assert_eq!(url.as_str(), "http://localhost:9000/prefix/storage/v1/b/b/o/o");
    }

    #[test]
    fn test_range_header() {
        assert_eq!(range_header(&ByteRange { start: 8192, limit: 10000 }).as_deref(), Some("bytes=8192-9999"));
        assert_eq!(range_header(&ByteRange { start: 0, limit: 1 }).as_deref(), Some("bytes=0-0"));
        assert_eq!(range_header(&ByteRange { start: 5, limit: 5 }), None);
    }

    #[test]
    fn test_parse_listing_page() {
        let json = r#"{
            "kind": "storage#objects",
            "nextPageToken": "CgV0bXAvYg==",
            "items": [
                {
                    "name": "tmp/a",
                    "size": "10000",
                    "generation": "1700000000000001",
                    "updated": "2024-05-01T12:30:00.000Z",
                    "contentEncoding": "gzip"
                },
                {
                    "name": "tmp/b",
                    "size": "0",
                    "generation": "7",
                    "updated": "2024-05-01T12:00:00Z"
                }
            ]
        }"#;

        let page: ObjectsPage = serde_json::from_str(json).unwrap();
        let listing = Listing::try_from(page).unwrap();

        assert_eq!(listing.continuation_token.as_deref(), Some("CgV0bXAvYg=="));
        assert_eq!(listing.min_objects.len(), 2);

        let a = &listing.min_objects[0];
        assert_eq!(a.name, "tmp/a");
        assert_eq!(a.size, 10_000);
        assert_eq!(a.generation, 1_700_000_000_000_001);
        assert_eq!(a.updated, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        assert!(a.has_content_encoding_gzip());

        assert!(!listing.min_objects[1].has_content_encoding_gzip());
    }

    #[test]
    fn test_parse_empty_listing_page() {
        let page: ObjectsPage = serde_json::from_str(r#"{"kind": "storage#objects"}"#).unwrap();
        let listing = Listing::try_from(page).unwrap();

        assert!(listing.min_objects.is_empty());
        assert!(listing.continuation_token.is_none());
    }

    #[test]
    fn test_parse_invalid_size() {
        let json = r#"{"items": [{"name": "x", "size": "ten", "generation": "1", "updated": "2024-05-01T12:00:00Z"}]}"#;
        let page: ObjectsPage = serde_json::from_str(json).unwrap();

        assert!(matches!(Listing::try_from(page), Err(Error::InvalidMetadata(_))));
    }
}
