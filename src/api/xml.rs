//! S3 XML response builders and request parsers for the operations the
//! proxy terminates (multipart lifecycle). Pass-through responses are
//! relayed verbatim and never rebuilt here.

use crate::multipart::{PartInfo, UploadInfo};
use serde::Deserialize;

/// XML-escape text content.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// CreateMultipartUpload response
#[derive(Debug, Clone)]
pub struct InitiateMultipartUploadResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

impl InitiateMultipartUploadResult {
    pub fn to_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>{}</Bucket>
  <Key>{}</Key>
  <UploadId>{}</UploadId>
</InitiateMultipartUploadResult>"#,
            escape_xml(&self.bucket),
            escape_xml(&self.key),
            escape_xml(&self.upload_id)
        )
    }
}

/// CompleteMultipartUpload request body
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteMultipartUploadRequest {
    #[serde(rename = "Part", default)]
    pub parts: Vec<CompleteRequestPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteRequestPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

impl CompleteMultipartUploadRequest {
    pub fn from_xml(xml: &str) -> Result<Self, quick_xml::DeError> {
        quick_xml::de::from_str(xml)
    }
}

/// CompleteMultipartUpload response
#[derive(Debug, Clone)]
pub struct CompleteMultipartUploadResult {
    pub location: String,
    pub bucket: String,
    pub key: String,
    pub etag: String,
}

impl CompleteMultipartUploadResult {
    pub fn to_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Location>{}</Location>
  <Bucket>{}</Bucket>
  <Key>{}</Key>
  <ETag>{}</ETag>
</CompleteMultipartUploadResult>"#,
            escape_xml(&self.location),
            escape_xml(&self.bucket),
            escape_xml(&self.key),
            escape_xml(&self.etag)
        )
    }
}

/// CopyObject response
#[derive(Debug, Clone)]
pub struct CopyObjectResult {
    pub etag: String,
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

impl CopyObjectResult {
    pub fn to_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<CopyObjectResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <ETag>{}</ETag>
  <LastModified>{}</LastModified>
</CopyObjectResult>"#,
            escape_xml(&self.etag),
            self.last_modified.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        )
    }
}

/// ListParts response
#[derive(Debug, Clone)]
pub struct ListPartsResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<PartInfo>,
    pub max_parts: u32,
    pub is_truncated: bool,
}

impl ListPartsResult {
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        xml.push('\n');
        xml.push_str(r#"<ListPartsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#);
        xml.push('\n');
        xml.push_str(&format!("  <Bucket>{}</Bucket>\n", escape_xml(&self.bucket)));
        xml.push_str(&format!("  <Key>{}</Key>\n", escape_xml(&self.key)));
        xml.push_str(&format!(
            "  <UploadId>{}</UploadId>\n",
            escape_xml(&self.upload_id)
        ));
        xml.push_str(&format!("  <MaxParts>{}</MaxParts>\n", self.max_parts));
        xml.push_str(&format!("  <IsTruncated>{}</IsTruncated>\n", self.is_truncated));
        for part in &self.parts {
            xml.push_str("  <Part>\n");
            xml.push_str(&format!("    <PartNumber>{}</PartNumber>\n", part.part_number));
            xml.push_str(&format!("    <ETag>{}</ETag>\n", escape_xml(&part.etag)));
            xml.push_str(&format!("    <Size>{}</Size>\n", part.size));
            xml.push_str(&format!(
                "    <LastModified>{}</LastModified>\n",
                part.last_modified.format("%Y-%m-%dT%H:%M:%S%.3fZ")
            ));
            xml.push_str("  </Part>\n");
        }
        xml.push_str("</ListPartsResult>");
        xml
    }
}

/// ListMultipartUploads response
#[derive(Debug, Clone)]
pub struct ListMultipartUploadsResult {
    pub bucket: String,
    pub prefix: String,
    pub uploads: Vec<UploadInfo>,
    pub max_uploads: u32,
    pub is_truncated: bool,
}

impl ListMultipartUploadsResult {
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        xml.push('\n');
        xml.push_str(
            r#"<ListMultipartUploadsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
        );
        xml.push('\n');
        xml.push_str(&format!("  <Bucket>{}</Bucket>\n", escape_xml(&self.bucket)));
        xml.push_str(&format!("  <Prefix>{}</Prefix>\n", escape_xml(&self.prefix)));
        xml.push_str(&format!("  <MaxUploads>{}</MaxUploads>\n", self.max_uploads));
        xml.push_str(&format!("  <IsTruncated>{}</IsTruncated>\n", self.is_truncated));
        for upload in &self.uploads {
            xml.push_str("  <Upload>\n");
            xml.push_str(&format!("    <Key>{}</Key>\n", escape_xml(&upload.key)));
            xml.push_str(&format!(
                "    <UploadId>{}</UploadId>\n",
                escape_xml(&upload.upload_id)
            ));
            xml.push_str(&format!(
                "    <Initiated>{}</Initiated>\n",
                upload.initiated.format("%Y-%m-%dT%H:%M:%S%.3fZ")
            ));
            xml.push_str("  </Upload>\n");
        }
        xml.push_str("</ListMultipartUploadsResult>");
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b>&c\"d'"), "a&lt;b&gt;&amp;c&quot;d&apos;");
        assert_eq!(escape_xml("plain"), "plain");
    }

    #[test]
    fn test_initiate_result() {
        let xml = InitiateMultipartUploadResult {
            bucket: "b".to_string(),
            key: "path/to/key".to_string(),
            upload_id: "abc123".to_string(),
        }
        .to_xml();
        assert!(xml.contains("<Bucket>b</Bucket>"));
        assert!(xml.contains("<Key>path/to/key</Key>"));
        assert!(xml.contains("<UploadId>abc123</UploadId>"));
    }

    #[test]
    fn test_parse_complete_request() {
        let xml = r#"<CompleteMultipartUpload>
            <Part><PartNumber>1</PartNumber><ETag>"etag1"</ETag></Part>
            <Part><PartNumber>2</PartNumber><ETag>"etag2"</ETag></Part>
        </CompleteMultipartUpload>"#;
        let req = CompleteMultipartUploadRequest::from_xml(xml).unwrap();
        assert_eq!(req.parts.len(), 2);
        assert_eq!(req.parts[0].part_number, 1);
        assert_eq!(req.parts[1].etag, "\"etag2\"");
    }

    #[test]
    fn test_parse_complete_request_rejects_garbage() {
        assert!(CompleteMultipartUploadRequest::from_xml("<not-xml").is_err());
    }

    #[test]
    fn test_list_parts_xml() {
        let xml = ListPartsResult {
            bucket: "b".to_string(),
            key: "k".to_string(),
            upload_id: "u".to_string(),
            parts: vec![crate::multipart::PartInfo {
                part_number: 1,
                etag: "\"e\"".to_string(),
                size: 42,
                last_modified: chrono::Utc::now(),
            }],
            max_parts: 1000,
            is_truncated: false,
        }
        .to_xml();
        assert!(xml.contains("<PartNumber>1</PartNumber>"));
        assert!(xml.contains("<Size>42</Size>"));
    }
}
