// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Infrastructure metadata attached to every root segment.
//!
//! Collecting these values (instance identity documents, ECS container names, Beanstalk
//! environment files) is left to the embedding application; the tracer only copies whatever it
//! is given into the segment's `aws` section.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub identity_document: Option<IdentityDocument>,
    pub ecs_container_name: Option<String>,
    pub beanstalk: Option<BeanstalkMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub account_id: String,
    pub instance_id: String,
    pub availability_zone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeanstalkMetadata {
    #[serde(rename = "environment_name")]
    pub environment: String,
    pub version_label: String,
    pub deployment_id: i64,
}

impl PluginMetadata {
    /// Flattens the metadata into the fields of a segment's `aws` section.
    pub(crate) fn aws_fields(&self) -> Map<String, Value> {
        let mut aws = Map::new();

        if let Some(doc) = &self.identity_document {
            aws.insert("account_id".to_string(), doc.account_id.clone().into());
            aws.insert("instance_id".to_string(), doc.instance_id.clone().into());
            aws.insert(
                "availability_zone".to_string(),
                doc.availability_zone.clone().into(),
            );
        }

        if let Some(container) = &self.ecs_container_name {
            aws.insert("container".to_string(), container.clone().into());
        }

        if let Some(beanstalk) = &self.beanstalk {
            aws.insert("environment".to_string(), beanstalk.environment.clone().into());
            aws.insert(
                "version_label".to_string(),
                beanstalk.version_label.clone().into(),
            );
            aws.insert("deployment_id".to_string(), beanstalk.deployment_id.into());
        }

        aws
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_metadata_has_no_fields() {
        assert!(PluginMetadata::default().aws_fields().is_empty());
    }

    #[test]
    fn test_all_sources_flattened() {
        let metadata = PluginMetadata {
            identity_document: Some(IdentityDocument {
                account_id: "123456789012".to_string(),
                instance_id: "i-0abc".to_string(),
                availability_zone: "us-west-2a".to_string(),
            }),
            ecs_container_name: Some("colorteller".to_string()),
            beanstalk: Some(BeanstalkMetadata {
                environment: "prod".to_string(),
                version_label: "v42".to_string(),
                deployment_id: 7,
            }),
        };

        let aws = metadata.aws_fields();
        assert_eq!(aws["account_id"], "123456789012");
        assert_eq!(aws["instance_id"], "i-0abc");
        assert_eq!(aws["availability_zone"], "us-west-2a");
        assert_eq!(aws["container"], "colorteller");
        assert_eq!(aws["environment"], "prod");
        assert_eq!(aws["version_label"], "v42");
        assert_eq!(aws["deployment_id"], 7);
    }
}
