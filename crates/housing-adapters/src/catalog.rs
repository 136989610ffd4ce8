//! Column mappings, key recipes and reference dates of every direct source.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use housing_core::{parse_date_token, SourceKind};

use crate::{AddressNormalizer, BasicAddressNormalizer, FieldMap, RawRow, SourceAdapter};

/// Field holding a source's reference date, with the accepted formats tried in
/// order against the first whitespace token of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSpec {
    pub field: &'static str,
    pub formats: &'static [&'static str],
}

impl DateSpec {
    pub fn parse(&self, fields: &FieldMap) -> Option<NaiveDate> {
        self.parse_value(fields.get(self.field)?)
    }

    pub fn parse_value(&self, raw: &str) -> Option<NaiveDate> {
        self.formats
            .iter()
            .find_map(|format| parse_date_token(raw, format))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyPart {
    Field(&'static str),
    Date,
}

/// A source whose output fields map one-to-one from input columns.
#[derive(Clone)]
pub struct DirectSource {
    kind: SourceKind,
    key: &'static [KeyPart],
    columns: &'static [(&'static str, &'static str)],
    date: Option<DateSpec>,
    address: &'static [&'static str],
    normalizer: Arc<dyn AddressNormalizer>,
}

impl std::fmt::Debug for DirectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectSource")
            .field("kind", &self.kind)
            .field("columns", &self.columns.len())
            .field("date", &self.date)
            .finish()
    }
}

pub const PLANNING_DATE: DateSpec = DateSpec {
    field: "date_opened",
    formats: &["%m/%d/%Y", "%Y-%m-%d"],
};
pub const PTS_DATE: DateSpec = DateSpec {
    field: "filed_date",
    formats: &["%m/%d/%Y"],
};
pub const TCO_DATE: DateSpec = DateSpec {
    field: "date_issued",
    formats: &["%Y/%m/%d"],
};
pub const BMR_DATE: DateSpec = DateSpec {
    field: "year_affordability_began",
    formats: &["%Y"],
};

/// Reference date declared for `kind`, if it has one.
pub fn date_spec_for(kind: SourceKind) -> Option<DateSpec> {
    match kind {
        SourceKind::Planning => Some(PLANNING_DATE),
        SourceKind::Pts => Some(PTS_DATE),
        SourceKind::Tco => Some(TCO_DATE),
        SourceKind::AffordableRental => Some(BMR_DATE),
        SourceKind::MohcdPipeline | SourceKind::MohcdInclusionary | SourceKind::PermitAddendaSummary => None,
    }
}

const STREET_ZIP: &[&str] = &["street_number", "street_name", "street_type", "zip_code"];

const PLANNING_COLUMNS: &[(&str, &str)] = &[
    ("record_id", "record_id"),
    ("record_type", "record_type"),
    ("record_type_category", "record_type_category"),
    ("record_name", "name"),
    ("description", "description"),
    ("parent", "parent"),
    ("children", "children"),
    ("record_status", "status"),
    ("date_opened", "date_opened"),
    ("date_closed", "date_closed"),
    ("address", "address"),
    ("the_geom", "the_geom"),
    ("planner_name", "planner_name"),
    ("planner_email", "planner_email"),
    ("planner_phone", "planner_phone"),
    ("RELATED_BUILDING_PERMIT", "building_permit_number"),
    ("LAND_USE_RESIDENTIAL_EXIST", "residential_sq_ft_existing"),
    ("LAND_USE_RESIDENTIAL_PROP", "residential_sq_ft_proposed"),
    ("LAND_USE_RESIDENTIAL_NET", "residential_sq_ft_net"),
    ("ADU", "is_adu"),
    ("PRJ_FEATURE_AFFORDABLE_EXIST", "affordable_units_existing"),
    ("PRJ_FEATURE_AFFORDABLE_PROP", "affordable_units_proposed"),
    ("PRJ_FEATURE_AFFORDABLE_NET", "affordable_units_net"),
    ("PRJ_FEATURE_MARKET_RATE_EXIST", "market_rate_units_existing"),
    ("PRJ_FEATURE_MARKET_RATE_PROP", "market_rate_units_proposed"),
    ("PRJ_FEATURE_MARKET_RATE_NET", "market_rate_units_net"),
    ("PRJ_FEATURE_PARKING_EXIST", "parking_sq_ft_exist"),
    ("PRJ_FEATURE_PARKING_PROP", "parking_sq_ft_proposed"),
    ("PRJ_FEATURE_PARKING_NET", "parking_sq_ft_net"),
    ("RESIDENTIAL_STUDIO_EXIST", "residential_units_studio_existing"),
    ("RESIDENTIAL_STUDIO_PROP", "residential_units_studio_proposed"),
    ("RESIDENTIAL_STUDIO_NET", "residential_units_studio_net"),
    ("RESIDENTIAL_1BR_EXIST", "residential_units_1br_existing"),
    ("RESIDENTIAL_1BR_PROP", "residential_units_1br_proposed"),
    ("RESIDENTIAL_1BR_NET", "residential_units_1br_net"),
    ("RESIDENTIAL_2BR_EXIST", "residential_units_2br_existing"),
    ("RESIDENTIAL_2BR_PROP", "residential_units_2br_proposed"),
    ("RESIDENTIAL_2BR_NET", "residential_units_2br_net"),
    ("RESIDENTIAL_3BR_EXIST", "residential_units_3br_existing"),
    ("RESIDENTIAL_3BR_PROP", "residential_units_3br_proposed"),
    ("RESIDENTIAL_3BR_NET", "residential_units_3br_net"),
    ("RESIDENTIAL_ADU_STUDIO_EXIST", "residential_units_adu_studio_existing"),
    ("RESIDENTIAL_ADU_STUDIO_PROP", "residential_units_adu_studio_proposed"),
    ("RESIDENTIAL_ADU_STUDIO_NET", "residential_units_adu_studio_net"),
    ("RESIDENTIAL_ADU_STUDIO_AREA", "residential_sq_ft_adu_studio"),
    ("RESIDENTIAL_ADU_1BR_EXIST", "residential_units_adu_1br_existing"),
    ("RESIDENTIAL_ADU_1BR_PROP", "residential_units_adu_1br_proposed"),
    ("RESIDENTIAL_ADU_1BR_NET", "residential_units_adu_1br_net"),
    ("RESIDENTIAL_ADU_1BR_AREA", "residential_sq_ft_adu_1br"),
    ("RESIDENTIAL_ADU_2BR_EXIST", "residential_units_adu_2br_existing"),
    ("RESIDENTIAL_ADU_2BR_PROP", "residential_units_adu_2br_proposed"),
    ("RESIDENTIAL_ADU_2BR_NET", "residential_units_adu_2br_net"),
    ("RESIDENTIAL_ADU_2BR_AREA", "residential_sq_ft_adu_2br"),
    ("RESIDENTIAL_ADU_3BR_EXIST", "residential_units_adu_3br_existing"),
    ("RESIDENTIAL_ADU_3BR_PROP", "residential_units_adu_3br_proposed"),
    ("RESIDENTIAL_ADU_3BR_NET", "residential_units_adu_3br_net"),
    ("RESIDENTIAL_ADU_3BR_AREA", "residential_sq_ft_adu_3br"),
    ("RESIDENTIAL_SRO_EXIST", "residential_units_sro_existing"),
    ("RESIDENTIAL_SRO_PROP", "residential_units_sro_proposed"),
    ("RESIDENTIAL_SRO_NET", "residential_units_sro_net"),
    ("RESIDENTIAL_MICRO_EXIST", "residential_units_micro_existing"),
    ("RESIDENTIAL_MICRO_PROP", "residential_units_micro_proposed"),
    ("RESIDENTIAL_MICRO_NET", "residential_units_micro_net"),
];

const PTS_COLUMNS: &[(&str, &str)] = &[
    ("Record ID", "record_id"),
    ("Permit Number", "permit_number"),
    ("Permit Type", "permit_type"),
    ("Permit Type Definition", "permit_type_definition"),
    ("Permit Creation Date", "permit_creation_date"),
    ("Block", "block"),
    ("Lot", "lot"),
    ("Street Number", "street_number"),
    ("Street Number Suffix", "street_number_suffix"),
    ("Street Name", "street_name"),
    ("Street Name Suffix", "street_name_suffix"),
    ("Unit", "unit"),
    ("Unit Suffix", "unit_suffix"),
    ("Zipcode", "zipcode"),
    ("Location", "location"),
    ("Supervisor District", "supervisor_district"),
    ("Current Status", "current_status"),
    ("Current Status Date", "current_status_date"),
    ("Filed Date", "filed_date"),
    ("Issued Date", "issued_date"),
    ("Completed Date", "completed_date"),
    ("First Construction Document Date", "first_construction_document_date"),
    ("Permit Expiration Date", "permit_expiration_date"),
    ("Existing Use", "existing_use"),
    ("Proposed Use", "proposed_use"),
    ("Existing Units", "existing_units"),
    ("Proposed Units", "proposed_units"),
    ("Existing Construction Type", "existing_construction_type"),
    ("Existing Construction Type Description", "existing_construction_type_description"),
    ("Proposed Construction Type", "proposed_construction_type"),
    ("Proposed Construction Type Description", "proposed_construction_type_description"),
];

const TCO_COLUMNS: &[(&str, &str)] = &[
    ("Building Permit Application Number", "building_permit_number"),
    ("Building Address", "address"),
    ("Date Issued", "date_issued"),
    ("Document Type", "building_permit_type"),
    ("Number of Units Certified", "num_units"),
];

const MOHCD_INCLUSIONARY_COLUMNS: &[(&str, &str)] = &[
    ("Project ID", "project_id"),
    ("Project Status", "project_status"),
    ("Project Name", "project_name"),
    ("Street Number", "street_number"),
    ("Street Name", "street_name"),
    ("Street Type", "street_type"),
    ("Zip Code", "zip_code"),
    ("Housing Tenure", "housing_tenure"),
    ("Section 415 Declaration", "section_415_declaration"),
    ("Entitlement Approval Date", "entitlement_approval_date"),
    ("Actual/Estimated Completion Date", "date_estimated_or_actual_completion"),
    ("Planning Case Number", "planning_case_number"),
    ("Planning Entitlements", "planning_entitlements"),
    ("Project Units", "total_project_units"),
    ("Affordable Units", "total_affordable_units"),
    ("Units Subject to Section 415", "units_subject_to_415_declaration"),
    ("On-Site Affordable Units", "on_site_affordable_units"),
    ("Off-Site Affordable Units", "off_site_affordable_units"),
    ("Off-Site Affordable Units at This Site", "off_site_affordable_units_at_site"),
    ("SRO Units", "num_sro_units"),
    ("Studio Units", "num_studio_units"),
    ("1bd Units", "num_1bd_units"),
    ("2bd Units", "num_2bd_units"),
    ("3bd Units", "num_3bd_units"),
    ("4bd Units", "num_4bd_units"),
    ("30% AMI", "num_30_percent_ami_units"),
    ("50% AMI", "num_50_percent_ami_units"),
    ("55% AMI", "num_55_percent_ami_units"),
    ("60% AMI", "num_60_percent_ami_units"),
    ("80% AMI", "num_80_percent_ami_units"),
    ("90% AMI", "num_90_percent_ami_units"),
    ("100% AMI", "num_100_percent_ami_units"),
    ("120% AMI", "num_120_percent_ami_units"),
    ("150% AMI", "num_150_percent_ami_units"),
    ("Supervisor District", "supervisor_district"),
    ("Location", "location"),
];

// The upstream pipeline export really does have two spaces in
// "Planning  Case Number".
const MOHCD_PIPELINE_COLUMNS: &[(&str, &str)] = &[
    ("Project ID", "project_id"),
    ("Project Status", "project_status"),
    ("Project Name", "project_name"),
    ("Street Number", "street_number"),
    ("Street Name", "street_name"),
    ("Street Type", "street_type"),
    ("Zip Code", "zip_code"),
    ("Supervisor District", "supervisor_district"),
    ("Location", "location"),
    ("Project Lead Sponsor", "project_lead_sponsor"),
    ("Project Owner", "project_owner"),
    ("Lead Agency", "lead_agency"),
    ("Program Area", "program_area"),
    ("Project Type", "project_type"),
    ("Housing Tenure", "housing_tenure"),
    ("Issuance of Notice to Proceed", "date_issuance_of_notice_to_proceed"),
    ("Issuance of Building Permit", "date_issuance_of_building_permit"),
    ("Issuance of First Construction Document", "date_issuance_of_first_construction_document"),
    ("Estimated/Actual Construction Start Date", "date_estimated_or_actual_actual_construction_start"),
    ("Estimated Construction Completion", "date_estimated_construction_completion"),
    ("Planning  Case Number", "planning_case_number"),
    ("Planning Entitlements", "planning_entitlements"),
    ("Section 415 Declaration", "section_415_declaration"),
    ("Project Units", "total_project_units"),
    ("Affordable Units", "total_affordable_units"),
    ("Market Rate Units", "total_market_rate_units"),
    ("% Affordable", "percent_affordable"),
    ("SRO Units", "num_sro_units"),
    ("Studio Units", "num_studio_units"),
    ("1bd Units", "num_1bd_units"),
    ("2bd Units", "num_2bd_units"),
    ("3bd Units", "num_3bd_units"),
    ("4bd Units", "num_4bd_units"),
    ("5+ bd Units", "num_5_plus_bd_units"),
    ("20% AMI", "num_20_percent_ami_units"),
    ("30% AMI", "num_30_percent_ami_units"),
    ("40% AMi", "num_40_percent_ami_units"),
    ("50% AMI", "num_50_percent_ami_units"),
    ("55% AMI", "num_55_percent_ami_units"),
    ("60% AMI", "num_60_percent_ami_units"),
    ("80% AMI", "num_80_percent_ami_units"),
    ("90% AMI", "num_90_percent_ami_units"),
    ("100% AMI", "num_100_percent_ami_units"),
    ("105% AMI", "num_105_percent_ami_units"),
    ("110% AMI", "num_110_percent_ami_units"),
    ("120% AMI", "num_120_percent_ami_units"),
    ("130% AMI", "num_130_percent_ami_units"),
    ("150% AMI", "num_150_percent_ami_units"),
    ("AMI Undeclared", "num_ami_undeclared_units"),
];

const AFFORDABLE_RENTAL_COLUMNS: &[(&str, &str)] = &[
    ("Project ID", "project_id"),
    ("Project Name", "project_name"),
    ("Street Number", "street_number"),
    ("Street Name", "street_name"),
    ("Street Type", "street_type"),
    ("Zip Code", "zip_code"),
    ("Location", "location"),
    ("Supervisor District", "supervisor_district"),
    ("Project Sponsor", "project_sponsor"),
    ("Total Units", "total_units"),
    ("Total Beds", "total_beds"),
    ("Affordable Units", "total_affordable_units"),
    ("Affordable Beds", "total_affordable_beds"),
    ("Single Room Occupancy Units", "num_sro_units"),
    ("Studio Units", "num_studio_units"),
    ("1bd Units", "num_1bd_units"),
    ("2bd Units", "num_2bd_units"),
    ("3bd Units", "num_3bd_units"),
    ("4bd Units", "num_4bd_units"),
    ("5+ bd Units", "num_5_plus_bd_units"),
    ("Family Units", "num_family_units"),
    ("Senior Units", "num_senior_units"),
    ("TAY Units", "num_tay_units"),
    ("Homeless Units", "num_homeless_units"),
    ("LOSP Units", "num_losp_units"),
    ("Disabled Units", "num_disabled_units"),
    ("20% AMI", "num_20_percent_ami_units"),
    ("30% AMI", "num_30_percent_ami_units"),
    ("40% AMI", "num_40_percent_ami_units"),
    ("50% AMI", "num_50_percent_ami_units"),
    ("60% AMI", "num_60_percent_ami_units"),
    ("80% AMI", "num_80_percent_ami_units"),
    ("120% AMI", "num_120_percent_ami_units"),
    ("More than 120% AMI", "num_more_than_120_percent_ami_units"),
    ("Year Building Constructed", "year_constructed"),
    ("Year Affordability Began", "year_affordability_began"),
];

impl DirectSource {
    /// Catalog entry for `kind`; `None` for sources that are not a direct
    /// column mapping.
    pub fn for_kind(kind: SourceKind) -> Option<Self> {
        let (key, columns, address): (
            &'static [KeyPart],
            &'static [(&'static str, &'static str)],
            &'static [&'static str],
        ) = match kind {
            SourceKind::Planning => (
                &[KeyPart::Field("record_id")],
                PLANNING_COLUMNS,
                &["address"],
            ),
            SourceKind::Pts => (
                &[KeyPart::Field("record_id")],
                PTS_COLUMNS,
                &[
                    "street_number",
                    "street_number_suffix",
                    "street_name",
                    "street_name_suffix",
                    "unit",
                    "unit_suffix",
                    "zipcode",
                ],
            ),
            SourceKind::Tco => (
                &[KeyPart::Field("building_permit_number"), KeyPart::Date],
                TCO_COLUMNS,
                &["address"],
            ),
            SourceKind::MohcdPipeline => (
                &[KeyPart::Field("project_id")],
                MOHCD_PIPELINE_COLUMNS,
                STREET_ZIP,
            ),
            SourceKind::MohcdInclusionary => (
                &[KeyPart::Field("project_id")],
                MOHCD_INCLUSIONARY_COLUMNS,
                STREET_ZIP,
            ),
            SourceKind::AffordableRental => (
                &[KeyPart::Field("project_id")],
                AFFORDABLE_RENTAL_COLUMNS,
                STREET_ZIP,
            ),
            SourceKind::PermitAddendaSummary => return None,
        };
        Some(Self {
            kind,
            key,
            columns,
            date: date_spec_for(kind),
            address,
            normalizer: Arc::new(BasicAddressNormalizer::default()),
        })
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn AddressNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn output_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|(_, field)| *field)
    }
}

impl SourceAdapter for DirectSource {
    fn source(&self) -> SourceKind {
        self.kind
    }

    fn fields(&self, row: &RawRow) -> FieldMap {
        let mut fields: FieldMap = BTreeMap::new();
        for (column, field) in self.columns {
            if let Some(value) = row.get(*column).map(|v| v.trim()) {
                if !value.is_empty() {
                    fields.insert((*field).to_string(), value.to_string());
                }
            }
        }

        let raw_address = self
            .address
            .iter()
            .filter_map(|field| fields.get(*field).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if !raw_address.trim().is_empty() {
            if let Some(normalized) = self.normalizer.normalize(&raw_address) {
                fields.insert("address_norm".to_string(), normalized);
            }
        }
        fields
    }

    fn foreign_key(&self, fields: &FieldMap) -> Option<String> {
        let mut parts = Vec::with_capacity(self.key.len());
        for part in self.key {
            match part {
                KeyPart::Field(name) => parts.push(fields.get(*name)?.clone()),
                KeyPart::Date => parts.push(self.reference_date(fields)?.format("%Y-%m-%d").to_string()),
            }
        }
        Some(self.kind.foreign_key(&parts.join("_")))
    }

    fn reference_date(&self, fields: &FieldMap) -> Option<NaiveDate> {
        self.date.as_ref().and_then(|spec| spec.parse(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn planning_fields_are_renamed_and_blank_values_dropped() {
        let adapter = DirectSource::for_kind(SourceKind::Planning).expect("planning");
        let fields = adapter.fields(&row(&[
            ("record_id", " 2016-001514PRJ "),
            ("record_name", "1 Main"),
            ("RELATED_BUILDING_PERMIT", "201601011234,201601015678"),
            ("date_opened", "04/05/2016 12:00:00 AM"),
            ("record_status", ""),
            ("unmapped", "ignored"),
            ("address", "1 main street 94105"),
        ]));

        assert_eq!(fields.get("record_id").map(String::as_str), Some("2016-001514PRJ"));
        assert_eq!(fields.get("name").map(String::as_str), Some("1 Main"));
        assert_eq!(
            fields.get("building_permit_number").map(String::as_str),
            Some("201601011234,201601015678")
        );
        assert!(!fields.contains_key("status"));
        assert!(!fields.contains_key("unmapped"));
        assert_eq!(
            fields.get("address_norm").map(String::as_str),
            Some("1 MAIN ST, SAN FRANCISCO, CA 94105")
        );
        assert_eq!(adapter.foreign_key(&fields).as_deref(), Some("planning_2016-001514PRJ"));
        assert_eq!(adapter.reference_date(&fields), NaiveDate::from_ymd_opt(2016, 4, 5));
    }

    #[test]
    fn tco_key_includes_the_issue_date() {
        let adapter = DirectSource::for_kind(SourceKind::Tco).expect("tco");
        let fields = adapter.fields(&row(&[
            ("Building Permit Application Number", "201705237369"),
            ("Date Issued", "2018/05/01"),
        ]));
        assert_eq!(adapter.foreign_key(&fields).as_deref(), Some("tco_201705237369_2018-05-01"));

        let undated = adapter.fields(&row(&[("Building Permit Application Number", "201705237369")]));
        assert_eq!(adapter.foreign_key(&undated), None);
    }

    #[test]
    fn sources_without_a_date_have_no_reference_date() {
        let adapter = DirectSource::for_kind(SourceKind::MohcdPipeline).expect("pipeline");
        let fields = adapter.fields(&row(&[
            ("Project ID", "2011-005"),
            ("Planning  Case Number", "2011.0218"),
        ]));
        assert_eq!(fields.get("planning_case_number").map(String::as_str), Some("2011.0218"));
        assert_eq!(adapter.foreign_key(&fields).as_deref(), Some("mohcd_pipeline_2011-005"));
        assert_eq!(adapter.reference_date(&fields), None);
        assert!(DirectSource::for_kind(SourceKind::PermitAddendaSummary).is_none());
    }

    #[test]
    fn year_only_dates_parse_to_january_first() {
        let adapter = DirectSource::for_kind(SourceKind::AffordableRental).expect("bmr");
        let fields = adapter.fields(&row(&[("Project ID", "2013-037"), ("Year Affordability Began", "2004")]));
        assert_eq!(adapter.reference_date(&fields), NaiveDate::from_ymd_opt(2004, 1, 1));
        assert_eq!(adapter.foreign_key(&fields).as_deref(), Some("bmr_2013-037"));
    }
}
