use da_core::{DocumentFormat, ExtractedText, UploadedDocument};
use da_error::{DaError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// 相邻两页文本之间插入的分页标记
pub const PAGE_BREAK: &str = "\n\n--- page break ---\n\n";

/// 默认上传上限 50 MB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExtractorLimits {
    pub max_bytes: u64,
}

impl Default for ExtractorLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// 不解码的前置检查：大小优先，然后是格式
pub fn precheck(document: &UploadedDocument, limits: &ExtractorLimits) -> Result<DocumentFormat> {
    if document.size() > limits.max_bytes {
        return Err(DaError::DocumentTooLarge {
            size: document.size(),
            limit: limits.max_bytes,
        });
    }
    document.format().ok_or_else(|| DaError::UnsupportedFormat {
        file_name: document.file_name.clone(),
        detected: document.declared_type(),
    })
}

/// 把上传文件转换为规范化文本。CPU 密集，异步上下文中应放到阻塞线程池执行。
#[instrument(skip(document, limits), fields(file_name = %document.file_name, size = document.size()))]
pub fn extract(document: UploadedDocument, limits: &ExtractorLimits) -> Result<ExtractedText> {
    let format = precheck(&document, limits)?;
    let UploadedDocument {
        file_name, bytes, ..
    } = document;

    let (content, pages) = match format {
        DocumentFormat::Pdf => extract_pdf(&file_name, &bytes)?,
        DocumentFormat::Txt => (decode_txt(&file_name, &bytes)?, 1),
    };
    let text = ExtractedText::new(content, file_name, pages)?;
    debug!(
        format = format.as_str(),
        characters = text.char_count,
        pages = text.pages,
        "text extracted"
    );
    Ok(text)
}

fn decode_txt(file_name: &str, bytes: &[u8]) -> Result<String> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    std::str::from_utf8(body)
        .map(str::to_owned)
        .map_err(|e| DaError::DecodingError {
            file_name: file_name.to_string(),
            reason: format!("invalid UTF-8 at byte {}", e.valid_up_to()),
        })
}

/// 逐页抽取；失败或空白的页跳过
fn extract_pdf(file_name: &str, bytes: &[u8]) -> Result<(String, usize)> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| DaError::DecodingError {
        file_name: file_name.to_string(),
        reason: format!("not a readable PDF: {}", e),
    })?;

    let mut parts: Vec<String> = Vec::new();
    let mut skipped = 0usize;
    for page_num in doc.get_pages().keys() {
        match doc.extract_text(&[*page_num]) {
            Ok(raw) => {
                let page = normalize_page(&raw);
                if page.is_empty() {
                    skipped += 1;
                } else {
                    parts.push(page);
                }
            }
            Err(e) => {
                debug!(page = page_num, error = %e, "page has no extractable text");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        debug!(skipped, kept = parts.len(), "pdf pages skipped");
    }
    let pages = parts.len();
    Ok((parts.join(PAGE_BREAK), pages))
}

fn normalize_page(raw: &str) -> String {
    raw.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
