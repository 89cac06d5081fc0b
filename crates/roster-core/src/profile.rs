use serde::{Deserialize, Serialize};

macro_rules! profile_fields {
    ($($field:ident => $variant:ident),+ $(,)?) => {
        /// Descriptive fields copied verbatim from the membership export.
        #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub struct MemberProfile {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<String>,
            )+
        }

        /// Addressable slot in [`MemberProfile`], used by declarative field maps.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ProfileField {
            $($variant),+
        }

        impl ProfileField {
            pub const ALL: &'static [ProfileField] = &[$(ProfileField::$variant),+];

            pub fn column(&self) -> &'static str {
                match self {
                    $(ProfileField::$variant => stringify!($field)),+
                }
            }
        }

        impl MemberProfile {
            pub fn get(&self, field: ProfileField) -> Option<&str> {
                match field {
                    $(ProfileField::$variant => self.$field.as_deref()),+
                }
            }

            pub fn slot_mut(&mut self, field: ProfileField) -> &mut Option<String> {
                match field {
                    $(ProfileField::$variant => &mut self.$field),+
                }
            }
        }
    };
}

profile_fields! {
    known_as => KnownAs,
    fore1 => Fore1,
    fore2 => Fore2,
    surname => Surname,
    date_of_birth => DateOfBirth,
    gender => Gender,
    ethnic_region => EthnicRegion,
    ethnic_origin => EthnicOrigin,
    home_phone => HomePhone,
    work_phone => WorkPhone,
    address_line1 => AddressLine1,
    address_line2 => AddressLine2,
    address_line3 => AddressLine3,
    address_line4 => AddressLine4,
    address_line5 => AddressLine5,
    postcode => Postcode,
    region => Region,
    branch => Branch,
    forum => Forum,
    industry => Industry,
    sub_industry => SubIndustry,
    sector => Sector,
    employer => Employer,
    employer_ref => EmployerRef,
    workplace => Workplace,
    workplace_ref => WorkplaceRef,
    site_prefix => SitePrefix,
    department => Department,
    job_title => JobTitle,
    occupation => Occupation,
    employment_status => EmploymentStatus,
    organiser => Organiser,
    delegate_role => DelegateRole,
    bargaining_group => BargainingGroup,
    payroll_number => PayrollNumber,
    membership_type => MembershipType,
    membership_status => MembershipStatus,
    financial_indicator => FinancialIndicator,
    join_date => JoinDate,
    last_payment_date => LastPaymentDate,
}

impl MemberProfile {
    pub fn populated_count(&self) -> usize {
        ProfileField::ALL
            .iter()
            .filter(|field| self.get(**field).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_address_distinct_fields() {
        let mut profile = MemberProfile::default();
        for (idx, field) in ProfileField::ALL.iter().enumerate() {
            *profile.slot_mut(*field) = Some(idx.to_string());
        }
        assert_eq!(profile.populated_count(), ProfileField::ALL.len());
        assert_eq!(profile.get(ProfileField::Branch), profile.branch.as_deref());
        assert_eq!(ProfileField::SubIndustry.column(), "sub_industry");
    }

    #[test]
    fn empty_fields_are_omitted_from_json() {
        let mut profile = MemberProfile::default();
        profile.region = Some("Auckland".into());
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json, serde_json::json!({ "region": "Auckland" }));
    }
}
