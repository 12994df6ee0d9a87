//! Request canonicalisation and idempotent creation of request records.

use crate::error::CubeflowError;
use crate::models::{CoordinateRange, RequestParameters, RequestRecord, SubmissionForm};
use crate::store::RequestStore;

use serde_json::Value;
use std::collections::BTreeMap;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;
use tracing::Level;
use validator::Validate;

/// Number of times a conflicting record is read back before giving up.
const READ_BACK_ATTEMPTS: usize = 10;

const ISO_DATE: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const US_DATE: &[FormatItem<'static>] = format_description!("[month]/[day]/[year]");

/// The request contract shared by every application.
///
/// An unspecialised kind cannot derive a product or accept extra fields.
pub trait RequestKind: Send + Sync {
    /// Application id
    fn id(&self) -> &str;

    /// Derive the data product from the platform and area.
    fn derive_product(&self, _platform: &str, _area_id: &str) -> Result<String, CubeflowError> {
        Err(CubeflowError::NotImplemented {
            operation: "derive_product",
            kind: self.id().to_string(),
        })
    }

    /// Canonicalise application specific fields.
    fn canonicalize_extra(
        &self,
        _extra: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, String>, CubeflowError> {
        Err(CubeflowError::NotImplemented {
            operation: "canonicalize_extra",
            kind: self.id().to_string(),
        })
    }

    fn default_title(&self) -> &str {
        "Base Query"
    }

    fn default_description(&self) -> &str {
        "None"
    }
}

/// Normalise extra fields to strings.
///
/// Lists are sorted, deduplicated and comma joined; strings are trimmed; nulls are
/// dropped. Fields not named in `allowed` are rejected.
pub fn normalize_extra(
    extra: &BTreeMap<String, Value>,
    allowed: &[&str],
) -> Result<BTreeMap<String, String>, CubeflowError> {
    let mut normalized = BTreeMap::new();
    for (name, value) in extra {
        if !allowed.contains(&name.as_str()) {
            return Err(CubeflowError::invalid_argument(
                "extra",
                format!("unexpected field {}", name),
            ));
        }
        let value = match value {
            Value::Null => continue,
            Value::Array(items) => {
                let mut items = items.iter().map(scalar).collect::<Result<Vec<_>, _>>()?;
                items.sort();
                items.dedup();
                items.join(",")
            }
            value => scalar(value)?,
        };
        normalized.insert(name.clone(), value);
    }
    Ok(normalized)
}

fn scalar(value: &Value) -> Result<String, CubeflowError> {
    match value {
        Value::String(string) => Ok(string.trim().to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        value => Err(CubeflowError::invalid_argument(
            "extra",
            format!("{} is not a scalar value", value),
        )),
    }
}

/// Parse a date as `YYYY-MM-DD` or `MM/DD/YYYY`.
pub fn parse_date(name: &'static str, value: &str) -> Result<Date, CubeflowError> {
    let value = value.trim();
    Date::parse(value, ISO_DATE)
        .or_else(|_| Date::parse(value, US_DATE))
        .map_err(|_| {
            CubeflowError::invalid_argument(
                name,
                format!("{} is not a date of the form YYYY-MM-DD or MM/DD/YYYY", value),
            )
        })
}

/// Map negative zero to zero so that equal extents have equal identities.
fn normalize_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

fn or_default(value: &Option<String>, default: &str) -> String {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => default.to_string(),
    }
}

/// Canonicalise a submission into request parameters.
pub fn canonicalize<K: RequestKind + ?Sized>(
    kind: &K,
    form: &SubmissionForm,
) -> Result<RequestParameters, CubeflowError> {
    form.validate()?;
    let time_start = parse_date("time_start", &form.time_start)?;
    let time_end = parse_date("time_end", &form.time_end)?;
    if time_start > time_end {
        return Err(CubeflowError::invalid_range(format!(
            "time_start {} is after time_end {}",
            time_start, time_end
        )));
    }
    let platform = form.platform.trim().to_string();
    let area_id = form.area_id.trim().to_string();
    Ok(RequestParameters {
        application: kind.id().to_string(),
        product: kind.derive_product(&platform, &area_id)?,
        platform,
        area_id,
        time_start,
        time_end,
        latitude: CoordinateRange::new(
            normalize_zero(form.latitude_min),
            normalize_zero(form.latitude_max),
        )?,
        longitude: CoordinateRange::new(
            normalize_zero(form.longitude_min),
            normalize_zero(form.longitude_max),
        )?,
        title: or_default(&form.title, kind.default_title()),
        description: or_default(&form.description, kind.default_description()),
        extra: kind.canonicalize_extra(&form.extra)?,
    })
}

impl RequestParameters {
    /// Canonical string form of every identity field.
    pub fn canonical_string(&self) -> String {
        let extra = self
            .extra
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.application,
            self.platform,
            self.product,
            self.area_id,
            self.time_start,
            self.time_end,
            self.latitude.min(),
            self.latitude.max(),
            self.longitude.min(),
            self.longitude.max(),
            self.title,
            self.description,
            extra
        )
    }

    /// Digest identifying requests with equal parameters.
    pub fn identity_key(&self) -> String {
        format!("{:x}", md5::compute(self.canonical_string()))
    }
}

/// Return the record for a submission, creating it if no equal request exists.
///
/// Returns the record and whether it was created by this call.
#[tracing::instrument(level = "DEBUG", skip_all, fields(application = kind.id()))]
pub fn get_or_create<K: RequestKind + ?Sized>(
    kind: &K,
    store: &dyn RequestStore,
    form: &SubmissionForm,
) -> Result<(RequestRecord, bool), CubeflowError> {
    let parameters = canonicalize(kind, form)?;
    let identity = parameters.identity_key();
    if let Some(existing) = store.find_by_identity(&identity)? {
        return Ok((existing, false));
    }
    let record = RequestRecord::new(parameters);
    match store.insert(&record) {
        Ok(()) => {
            tracing::event!(Level::INFO, "Created request {}", record.id);
            Ok((record, true))
        }
        Err(CubeflowError::DuplicateRequest { identity }) => {
            tracing::event!(Level::DEBUG, "Lost creation race for {}, reading back", identity);
            for _ in 0..READ_BACK_ATTEMPTS {
                if let Some(existing) = store.find_by_identity(&identity)? {
                    return Ok((existing, false));
                }
                std::thread::yield_now();
            }
            Err(CubeflowError::DuplicateRequest { identity })
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use crate::test_utils;

    use time::macros::date;

    struct Unspecialised;

    impl RequestKind for Unspecialised {
        fn id(&self) -> &str {
            "base"
        }
    }

    struct Landsat;

    impl RequestKind for Landsat {
        fn id(&self) -> &str {
            "mosaic"
        }

        fn derive_product(&self, platform: &str, area_id: &str) -> Result<String, CubeflowError> {
            Ok(format!("{}_{}", platform.to_lowercase(), area_id))
        }

        fn canonicalize_extra(
            &self,
            extra: &BTreeMap<String, Value>,
        ) -> Result<BTreeMap<String, String>, CubeflowError> {
            normalize_extra(extra, &["bands", "compositor"])
        }
    }

    #[test]
    fn unspecialised_kind() {
        let kind = Unspecialised;
        assert_eq!("Base Query", kind.default_title());
        assert_eq!("None", kind.default_description());
        match canonicalize(&kind, &test_utils::get_test_form()).unwrap_err() {
            CubeflowError::NotImplemented { operation, kind } => {
                assert_eq!("derive_product", operation);
                assert_eq!("base", kind);
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn canonicalize_defaults() {
        let parameters = canonicalize(&Landsat, &test_utils::get_test_form()).unwrap();
        assert_eq!("mosaic", parameters.application);
        assert_eq!("landsat_7_colombia", parameters.product);
        assert_eq!(date!(2015 - 01 - 01), parameters.time_start);
        assert_eq!(date!(2015 - 12 - 31), parameters.time_end);
        assert_eq!("Base Query", parameters.title);
        assert_eq!("None", parameters.description);
        assert!(parameters.extra.is_empty());
    }

    #[test]
    fn canonicalize_us_dates() {
        let mut form = test_utils::get_test_form();
        form.time_start = "01/01/2015".to_string();
        form.time_end = " 12/31/2015 ".to_string();
        let parameters = canonicalize(&Landsat, &form).unwrap();
        assert_eq!(date!(2015 - 01 - 01), parameters.time_start);
        assert_eq!(date!(2015 - 12 - 31), parameters.time_end);
    }

    #[test]
    fn canonicalize_bad_date() {
        let mut form = test_utils::get_test_form();
        form.time_end = "2015-13-01".to_string();
        match canonicalize(&Landsat, &form).unwrap_err() {
            CubeflowError::InvalidArgument { name, .. } => assert_eq!("time_end", name),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn canonicalize_inverted_dates() {
        let mut form = test_utils::get_test_form();
        form.time_start = "2016-01-01".to_string();
        assert!(matches!(
            canonicalize(&Landsat, &form).unwrap_err(),
            CubeflowError::InvalidRange { .. }
        ));
    }

    #[test]
    fn canonicalize_inverted_extent() {
        let mut form = test_utils::get_test_form();
        form.latitude_min = 2.0;
        assert!(matches!(
            canonicalize(&Landsat, &form).unwrap_err(),
            CubeflowError::RequestDataValidation(_)
        ));
    }

    #[test]
    fn canonicalize_negative_zero() {
        let mut form = test_utils::get_test_form();
        form.latitude_min = -0.0;
        let negative = canonicalize(&Landsat, &form).unwrap();
        form.latitude_min = 0.0;
        let positive = canonicalize(&Landsat, &form).unwrap();
        assert_eq!(positive.identity_key(), negative.identity_key());
    }

    #[test]
    fn canonicalize_extra_lists() {
        let mut form = test_utils::get_test_form();
        form.extra = BTreeMap::from([
            ("bands".to_string(), serde_json::json!(["red", "blue", "red", " green"])),
            ("compositor".to_string(), serde_json::json!("most_recent")),
        ]);
        let parameters = canonicalize(&Landsat, &form).unwrap();
        assert_eq!("blue,green,red", parameters.extra["bands"]);
        assert_eq!("most_recent", parameters.extra["compositor"]);
    }

    #[test]
    fn canonicalize_extra_unexpected() {
        let mut form = test_utils::get_test_form();
        form.extra = BTreeMap::from([("animation".to_string(), serde_json::json!(true))]);
        match canonicalize(&Landsat, &form).unwrap_err() {
            CubeflowError::InvalidArgument { reason, .. } => {
                assert_eq!("unexpected field animation", reason)
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn identity_includes_title() {
        let form = test_utils::get_test_form();
        let untitled = canonicalize(&Landsat, &form).unwrap();
        let mut form = test_utils::get_test_form();
        form.title = Some("My mosaic".to_string());
        let titled = canonicalize(&Landsat, &form).unwrap();
        assert_ne!(untitled.identity_key(), titled.identity_key());
        assert_eq!(32, titled.identity_key().len());
    }

    #[test]
    fn get_or_create_idempotent() {
        let store = SledStore::temporary().unwrap();
        let form = test_utils::get_test_form();
        let (first, created) = get_or_create(&Landsat, &store, &form).unwrap();
        assert!(created);
        let (second, created) = get_or_create(&Landsat, &store, &form).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn get_or_create_concurrent() {
        let store = SledStore::temporary().unwrap();
        let form = test_utils::get_test_form();
        let results = std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| scope.spawn(|| get_or_create(&Landsat, &store, &form).unwrap()))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(1, results.iter().filter(|(_, created)| *created).count());
        let id = results[0].0.id;
        assert!(results.iter().all(|(record, _)| record.id == id));
        assert_eq!(1, store.list().unwrap().len());
    }
}
