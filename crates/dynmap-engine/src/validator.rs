//! Static validation of mapping definitions.
//!
//! Every check returns the full list of violations so a caller can report all
//! problems of a mapping at once. A mapping is accepted only when
//! [`validate`] returns an empty list.

use dynmap_core::config::tokens::{TOPIC_WILDCARD_MULTI, TOPIC_WILDCARD_SINGLE};
use dynmap_core::topic::{is_separator, split_including_separator};
use dynmap_core::{Direction, Mapping};
use tracing::debug;

/// A rule a mapping definition violates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ValidationError {
    #[error("Only one multi level wildcard '#' is allowed")]
    OnlyOneMultiLevelWildcard,

    #[error("Multi level wildcard '#' is only allowed at the end of the topic")]
    MultiLevelWildcardOnlyAtEnd,

    #[error("Exactly one substitution defining the device identifier must be used")]
    OneSubstitutionDefiningDeviceIdentifierMustBeUsed,

    #[error("Only one substitution defining the device identifier can be used")]
    OnlyOneSubstitutionDefiningDeviceIdentifierCanBeUsed,

    #[error("Source template must be valid JSON")]
    SourceTemplateMustBeValidJson,

    #[error("Target template must be valid JSON")]
    TargetTemplateMustBeValidJson,

    #[error("Mapping topic and mapping topic sample do not have the same number of levels")]
    MappingTopicAndSampleLevelCount,

    #[error("Mapping topic and mapping topic sample do not have the same structure")]
    MappingTopicAndSampleStructure,

    #[error("Publish topic and publish topic sample do not have the same number of levels")]
    PublishTopicAndSampleLevelCount,

    #[error("Publish topic and publish topic sample do not have the same structure")]
    PublishTopicAndSampleStructure,
}

impl ValidationError {
    /// Stable error code for client handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OnlyOneMultiLevelWildcard => "Only_One_Multi_Level_Wildcard",
            Self::MultiLevelWildcardOnlyAtEnd => "Multi_Level_Wildcard_Only_At_End",
            Self::OneSubstitutionDefiningDeviceIdentifierMustBeUsed => {
                "One_Substitution_Defining_Device_Identifier_Must_Be_Used"
            }
            Self::OnlyOneSubstitutionDefiningDeviceIdentifierCanBeUsed => {
                "Only_One_Substitution_Defining_Device_Identifier_Can_Be_Used"
            }
            Self::SourceTemplateMustBeValidJson => "Source_Template_Must_Be_Valid_JSON",
            Self::TargetTemplateMustBeValidJson => "Target_Template_Must_Be_Valid_JSON",
            Self::MappingTopicAndSampleLevelCount => {
                "MappingTopic_And_MappingTopicSample_Do_Not_Have_Same_Number_Of_Levels_In_Topic_Name"
            }
            Self::MappingTopicAndSampleStructure => {
                "MappingTopic_And_MappingTopicSample_Do_Not_Have_Same_Structure_In_Topic_Name"
            }
            Self::PublishTopicAndSampleLevelCount => {
                "PublishTopic_And_PublishTopicSample_Do_Not_Have_Same_Number_Of_Levels_In_Topic_Name"
            }
            Self::PublishTopicAndSampleStructure => {
                "PublishTopic_And_PublishTopicSample_Do_Not_Have_Same_Structure_In_Topic_Name"
            }
        }
    }
}

/// Run every check against `mapping`.
pub fn validate(mapping: &Mapping) -> Vec<ValidationError> {
    let mut errors = validate_substitutions(mapping);
    errors.extend(validate_topics(mapping));
    errors.extend(validate_json_templates(mapping));
    if !errors.is_empty() {
        debug!(
            mapping_id = %mapping.id,
            codes = ?errors.iter().map(|e| e.code()).collect::<Vec<_>>(),
            "Mapping validation failed"
        );
    }
    errors
}

/// Exactly one device identifier substitution is required for inbound
/// mappings that go through the substitution engine.
pub fn validate_substitutions(mapping: &Mapping) -> Vec<ValidationError> {
    let skip = mapping.direction == Direction::Outbound || mapping.mapping_type.is_pass_through();
    if skip {
        return Vec::new();
    }

    match mapping.device_identifier_count() {
        0 => vec![ValidationError::OneSubstitutionDefiningDeviceIdentifierMustBeUsed],
        1 => Vec::new(),
        _ => vec![ValidationError::OnlyOneSubstitutionDefiningDeviceIdentifierCanBeUsed],
    }
}

/// Wildcard rules for inbound topics and topic/sample consistency.
pub fn validate_topics(mapping: &Mapping) -> Vec<ValidationError> {
    match mapping.direction {
        Direction::Inbound => {
            let mut errors = validate_mapping_topic(&mapping.mapping_topic);
            if let Some(sample) = mapping
                .mapping_topic_sample
                .as_deref()
                .filter(|s| !s.is_empty())
            {
                errors.extend(validate_topic_sample(
                    &mapping.mapping_topic,
                    sample,
                    TopicKind::Mapping,
                ));
            }
            errors
        }
        Direction::Outbound => match (&mapping.publish_topic, &mapping.publish_topic_sample) {
            (Some(topic), Some(sample)) => validate_topic_sample(topic, sample, TopicKind::Publish),
            _ => Vec::new(),
        },
    }
}

/// At most one `#`, and only as the last character.
pub fn validate_mapping_topic(topic: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let count = topic.matches(TOPIC_WILDCARD_MULTI).count();
    if count > 1 {
        errors.push(ValidationError::OnlyOneMultiLevelWildcard);
    }
    if count >= 1 && topic.find(TOPIC_WILDCARD_MULTI) != Some(topic.len() - 1) {
        errors.push(ValidationError::MultiLevelWildcardOnlyAtEnd);
    }
    errors
}

/// Which topic/sample pair is being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Mapping,
    Publish,
}

/// The sample must have the same levels as the topic, with literal levels
/// matching exactly. `+` matches any level; for publish topics `#` does too.
pub fn validate_topic_sample(topic: &str, sample: &str, kind: TopicKind) -> Vec<ValidationError> {
    let (count_error, structure_error) = match kind {
        TopicKind::Mapping => (
            ValidationError::MappingTopicAndSampleLevelCount,
            ValidationError::MappingTopicAndSampleStructure,
        ),
        TopicKind::Publish => (
            ValidationError::PublishTopicAndSampleLevelCount,
            ValidationError::PublishTopicAndSampleStructure,
        ),
    };

    let topic_levels = split_including_separator(topic);
    let sample_levels = split_including_separator(sample);
    if topic_levels.len() != sample_levels.len() {
        return vec![count_error];
    }

    let consistent = topic_levels.iter().zip(&sample_levels).all(|(t, s)| {
        if is_separator(t) != is_separator(s) {
            return false;
        }
        let wildcard = t == TOPIC_WILDCARD_SINGLE
            || (kind == TopicKind::Publish && t == TOPIC_WILDCARD_MULTI);
        is_separator(t) || wildcard || t == s
    });
    if consistent {
        Vec::new()
    } else {
        vec![structure_error]
    }
}

/// Templates must parse as JSON. The target template is not checked for
/// mapping types that produce their document outside the engine.
pub fn validate_json_templates(mapping: &Mapping) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if !is_valid_json(&mapping.source_template) {
        errors.push(ValidationError::SourceTemplateMustBeValidJson);
    }
    if !mapping.mapping_type.skips_target_template() && !is_valid_json(&mapping.target_template) {
        errors.push(ValidationError::TargetTemplateMustBeValidJson);
    }
    errors
}

fn is_valid_json(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_ok()
}
