//! Declarative mapping from export fields onto roster fields.

use chrono::NaiveDate;
use roster_core::{ContactDetails, MemberDraft, MemberProfile, ProfileField};

use crate::record::{RawRecord, RecordError};

pub const MEMBERSHIP_NUMBER_KEYS: &[&str] = &["membershipNumber", "membership_number", "memberNumber"];
pub const EMAIL_KEYS: &[&str] = &["primaryEmail", "email", "emailAddress"];
pub const MOBILE_KEYS: &[&str] = &["telephoneMobile", "mobilePhone", "mobile"];

/// Substrings that mark an address as a data-entry placeholder.
pub const PLACEHOLDER_EMAIL_PATTERNS: &[&str] = &[
    "noemail",
    "no-email",
    "nomail@",
    "@example.",
    "@test.",
    "@none.",
    "@unknown.",
    "@nomail.",
];

pub const MIN_MOBILE_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Trimmed scalar; blank becomes null.
    Text,
    /// Multi-valued field kept as its first element.
    FirstOfArray,
    /// Keep the calendar date of an ISO timestamp or a `dd/mm/yyyy` date.
    Date,
    Upper,
}

impl Transform {
    fn apply(self, raw: String) -> Option<String> {
        match self {
            Transform::Text | Transform::FirstOfArray => Some(raw),
            Transform::Upper => Some(raw.to_uppercase()),
            Transform::Date => Some(normalize_date(&raw)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub sources: &'static [&'static str],
    pub target: ProfileField,
    pub transform: Transform,
}

impl FieldRule {
    /// First populated source. Any field may arrive wrapped in an array.
    pub fn extract(&self, record: &RawRecord<'_>) -> Option<String> {
        let raw = record.first_text(self.sources)?;
        self.transform.apply(raw)
    }
}

const fn rule(
    sources: &'static [&'static str],
    target: ProfileField,
    transform: Transform,
) -> FieldRule {
    FieldRule {
        sources,
        target,
        transform,
    }
}

use ProfileField as F;
use Transform::{Date, FirstOfArray, Text, Upper};

pub const PROFILE_FIELD_MAP: &[FieldRule] = &[
    rule(&["knownAs", "preferredName"], F::KnownAs, Text),
    rule(&["fore1", "firstName", "forename"], F::Fore1, Text),
    rule(&["fore2", "middleName"], F::Fore2, Text),
    rule(&["surname", "lastName"], F::Surname, Text),
    rule(&["dob", "dateOfBirth"], F::DateOfBirth, Date),
    rule(&["genderDesc", "gender"], F::Gender, Text),
    rule(&["ethnicRegionDesc", "ethnicRegion"], F::EthnicRegion, FirstOfArray),
    rule(&["ethnicOriginDesc", "ethnicOrigin"], F::EthnicOrigin, FirstOfArray),
    rule(&["telephoneHome", "homePhone"], F::HomePhone, Text),
    rule(&["telephoneWork", "workPhone"], F::WorkPhone, Text),
    rule(&["addRes1", "address1"], F::AddressLine1, Text),
    rule(&["addRes2", "address2"], F::AddressLine2, Text),
    rule(&["addRes3", "address3"], F::AddressLine3, Text),
    rule(&["addRes4", "address4"], F::AddressLine4, Text),
    rule(&["addRes5", "address5"], F::AddressLine5, Text),
    rule(&["addResPc", "postcode"], F::Postcode, Upper),
    rule(&["regionDesc", "region"], F::Region, FirstOfArray),
    rule(&["branchDesc", "branch"], F::Branch, FirstOfArray),
    rule(&["forumDesc", "forum"], F::Forum, FirstOfArray),
    rule(&["siteIndustryDesc", "industry"], F::Industry, FirstOfArray),
    rule(&["siteSubIndustryDesc", "subIndustry"], F::SubIndustry, FirstOfArray),
    rule(&["sectorDesc", "sector"], F::Sector, FirstOfArray),
    rule(&["employerName", "employer"], F::Employer, FirstOfArray),
    rule(&["employerRef", "employerId"], F::EmployerRef, Text),
    rule(&["workplace", "siteName"], F::Workplace, FirstOfArray),
    rule(&["siteCode", "workplaceRef"], F::WorkplaceRef, Upper),
    rule(&["sitePrefix"], F::SitePrefix, Upper),
    rule(&["department", "departmentDesc"], F::Department, Text),
    rule(&["jobTitle"], F::JobTitle, Text),
    rule(&["occupation", "occupationDesc"], F::Occupation, FirstOfArray),
    rule(&["employmentStatus", "employmentType"], F::EmploymentStatus, Text),
    rule(&["organiserName", "organiser"], F::Organiser, FirstOfArray),
    rule(&["delegateRole", "delegateStatus"], F::DelegateRole, Text),
    rule(&["bargainingGroupDesc", "bargainingGroup"], F::BargainingGroup, FirstOfArray),
    rule(&["payrollNumber", "payrollNo"], F::PayrollNumber, Text),
    rule(&["membershipTypeDesc", "membershipType"], F::MembershipType, Text),
    rule(&["membershipStatus", "status"], F::MembershipStatus, Text),
    rule(&["financialIndicatorDesc", "financialIndicator"], F::FinancialIndicator, Text),
    rule(&["dateJoined", "joinDate"], F::JoinDate, Date),
    rule(&["lastPaymentDate"], F::LastPaymentDate, Date),
];

pub fn normalize_date(raw: &str) -> String {
    if let Some(date) = raw
        .get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
    {
        return date.format("%Y-%m-%d").to_string();
    }
    match NaiveDate::parse_from_str(raw, "%d/%m/%Y") {
        Ok(date) => date.format("%Y-%m-%d").to_string(),
        Err(_) => raw.to_string(),
    }
}

pub fn is_valid_email(email: Option<&str>) -> bool {
    let Some(email) = email.map(str::trim).filter(|e| !e.is_empty()) else {
        return false;
    };
    let lower = email.to_ascii_lowercase();
    let Some((local, domain)) = lower.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return false;
    }
    !PLACEHOLDER_EMAIL_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

pub fn is_valid_mobile(mobile: Option<&str>) -> bool {
    mobile
        .map(str::trim)
        .is_some_and(|m| m.chars().count() >= MIN_MOBILE_CHARS)
}

/// Preferred first name followed by surname; the membership number stands in when both are absent.
pub fn display_name(profile: &MemberProfile, membership_number: &str) -> String {
    let first = profile.known_as.as_deref().or(profile.fore1.as_deref());
    let name = [first, profile.surname.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        membership_number.to_string()
    } else {
        name
    }
}

pub fn map_profile(record: &RawRecord<'_>) -> MemberProfile {
    let mut profile = MemberProfile::default();
    for rule in PROFILE_FIELD_MAP {
        *profile.slot_mut(rule.target) = rule.extract(record);
    }
    profile
}

/// Map one raw record into a draft. Only a missing membership number is fatal.
pub fn map_record(record: &RawRecord<'_>) -> Result<MemberDraft, RecordError> {
    let membership_number = record
        .first_text(MEMBERSHIP_NUMBER_KEYS)
        .ok_or(RecordError::MissingMembershipNumber)?;
    let profile = map_profile(record);

    let primary_email = record.first_text(EMAIL_KEYS);
    let telephone_mobile = record.first_text(MOBILE_KEYS);
    let contact = ContactDetails {
        has_valid_email: is_valid_email(primary_email.as_deref()),
        has_valid_mobile: is_valid_mobile(telephone_mobile.as_deref()),
        primary_email,
        telephone_mobile,
    };

    Ok(MemberDraft {
        name: display_name(&profile, &membership_number),
        membership_number,
        contact,
        profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn every_profile_field_has_exactly_one_rule() {
        let targets: Vec<_> = PROFILE_FIELD_MAP.iter().map(|r| r.target).collect();
        let unique: HashSet<_> = targets.iter().copied().collect();
        assert_eq!(targets.len(), unique.len());
        assert_eq!(unique.len(), ProfileField::ALL.len());
    }

    #[test]
    fn minimal_record_maps_to_expected_draft() {
        let value = json!({
            "membershipNumber": "123",
            "fore1": "Jo",
            "surname": "Doe",
            "primaryEmail": "jo@x.com"
        });
        let draft = map_record(&RawRecord::from_value(&value).unwrap()).unwrap();
        assert_eq!(draft.membership_number, "123");
        assert_eq!(draft.name, "Jo Doe");
        assert!(draft.contact.has_valid_email);
        assert!(!draft.contact.has_valid_mobile);
        assert_eq!(draft.profile.populated_count(), 2);
    }

    #[test]
    fn heterogeneous_fields_are_normalized() {
        let value = json!({
            "membershipNumber": 98765,
            "knownAs": "Tui",
            "fore1": "Te Aroha",
            "surname": "Ngata",
            "regionDesc": ["Central"],
            "branch": ["Wellington", "Hutt"],
            "employerName": [],
            "employer": "Acme Foods",
            "dob": "1980-04-02T00:00:00",
            "dateJoined": "17/05/2011",
            "lastPaymentDate": "sometime",
            "addResPc": "ab12 3cd",
            "telephoneMobile": " 021 555 0199 ",
            "primaryEmail": "noemail@union.org.nz"
        });
        let draft = map_record(&RawRecord::from_value(&value).unwrap()).unwrap();
        assert_eq!(draft.membership_number, "98765");
        assert_eq!(draft.name, "Tui Ngata");
        assert_eq!(draft.profile.region.as_deref(), Some("Central"));
        assert_eq!(draft.profile.branch.as_deref(), Some("Wellington"));
        assert_eq!(draft.profile.employer.as_deref(), Some("Acme Foods"));
        assert_eq!(draft.profile.date_of_birth.as_deref(), Some("1980-04-02"));
        assert_eq!(draft.profile.join_date.as_deref(), Some("2011-05-17"));
        assert_eq!(draft.profile.last_payment_date.as_deref(), Some("sometime"));
        assert_eq!(draft.profile.postcode.as_deref(), Some("AB12 3CD"));
        assert!(draft.contact.has_valid_mobile);
        assert!(!draft.contact.has_valid_email);
        assert_eq!(draft.profile.industry, None);
    }

    #[test]
    fn array_wrapped_scalar_fields_are_unwrapped() {
        let value = json!({
            "membershipNumber": "1",
            "surname": ["Doe"],
            "jobTitle": ["Nurse", "Educator"],
            "genderDesc": ["Female"],
            "dob": ["1975-01-31T00:00:00"],
            "addResPc": ["ab1"]
        });
        let draft = map_record(&RawRecord::from_value(&value).unwrap()).unwrap();
        assert_eq!(draft.name, "Doe");
        assert_eq!(draft.profile.surname.as_deref(), Some("Doe"));
        assert_eq!(draft.profile.job_title.as_deref(), Some("Nurse"));
        assert_eq!(draft.profile.gender.as_deref(), Some("Female"));
        assert_eq!(draft.profile.date_of_birth.as_deref(), Some("1975-01-31"));
        assert_eq!(draft.profile.postcode.as_deref(), Some("AB1"));
    }

    #[test]
    fn blank_membership_number_is_a_record_error() {
        for value in [json!({"surname": "Doe"}), json!({"membershipNumber": "  "})] {
            let err = map_record(&RawRecord::from_value(&value).unwrap()).unwrap_err();
            assert_eq!(err, RecordError::MissingMembershipNumber);
        }
    }

    #[test]
    fn contact_validity_rules() {
        assert!(is_valid_email(Some("a.member@union.org.nz")));
        assert!(!is_valid_email(Some("   ")));
        assert!(!is_valid_email(None));
        assert!(!is_valid_email(Some("not-an-address")));
        assert!(!is_valid_email(Some("someone@example.com")));
        assert!(!is_valid_email(Some("NoEmail@Union.org")));

        assert!(is_valid_mobile(Some("0211234567")));
        assert!(is_valid_mobile(Some("  02112345  ")));
        assert!(!is_valid_mobile(Some(" 0211234 ")));
        assert!(!is_valid_mobile(None));
    }

    #[test]
    fn display_name_falls_back_to_membership_number() {
        let profile = MemberProfile::default();
        assert_eq!(display_name(&profile, "555"), "555");
        let profile = MemberProfile {
            surname: Some("Solo".into()),
            ..MemberProfile::default()
        };
        assert_eq!(display_name(&profile, "555"), "Solo");
    }
}
