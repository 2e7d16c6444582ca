use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ExtractionPhase {
    #[serde(rename = "phase_01_static_html")]
    StaticHtml,
    #[serde(rename = "phase_02_dynamic_js")]
    DynamicJs,
    #[serde(rename = "phase_03_main_article")]
    MainArticle,
    #[serde(rename = "phase_04_html_spec_table")]
    HtmlSpecTable,
    #[serde(rename = "phase_05_embedded_json")]
    EmbeddedJson,
    #[serde(rename = "phase_06_text_pdf")]
    TextPdf,
    #[serde(rename = "phase_07_scanned_pdf_ocr")]
    ScannedPdfOcr,
    #[serde(rename = "phase_08_image_ocr")]
    ImageOcr,
    #[serde(rename = "phase_09_chart_graph")]
    ChartGraph,
    #[serde(rename = "phase_10_office_mixed_doc")]
    OfficeMixedDoc,
}

impl ExtractionPhase {
    pub const ALL: [ExtractionPhase; 10] = [
        Self::StaticHtml,
        Self::DynamicJs,
        Self::MainArticle,
        Self::HtmlSpecTable,
        Self::EmbeddedJson,
        Self::TextPdf,
        Self::ScannedPdfOcr,
        Self::ImageOcr,
        Self::ChartGraph,
        Self::OfficeMixedDoc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaticHtml => "phase_01_static_html",
            Self::DynamicJs => "phase_02_dynamic_js",
            Self::MainArticle => "phase_03_main_article",
            Self::HtmlSpecTable => "phase_04_html_spec_table",
            Self::EmbeddedJson => "phase_05_embedded_json",
            Self::TextPdf => "phase_06_text_pdf",
            Self::ScannedPdfOcr => "phase_07_scanned_pdf_ocr",
            Self::ImageOcr => "phase_08_image_ocr",
            Self::ChartGraph => "phase_09_chart_graph",
            Self::OfficeMixedDoc => "phase_10_office_mixed_doc",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|phase| phase.as_str() == needle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSurface {
    NetworkJson,
    JsonLd,
    Microdata,
    Opengraph,
    EmbeddedStateJson,
    ScannedPdfOcr,
    PdfTable,
    PdfKv,
    PdfText,
    ScreenshotCapture,
    ImageOcr,
    ChartPayload,
    OfficeXlsx,
    OfficeDocx,
    OfficePptx,
    HtmlDefinitionList,
    HtmlSpecTable,
    MainArticle,
    DynamicDom,
    StaticDom,
}

impl SourceSurface {
    pub const ALL: [SourceSurface; 20] = [
        Self::NetworkJson,
        Self::JsonLd,
        Self::Microdata,
        Self::Opengraph,
        Self::EmbeddedStateJson,
        Self::ScannedPdfOcr,
        Self::PdfTable,
        Self::PdfKv,
        Self::PdfText,
        Self::ScreenshotCapture,
        Self::ImageOcr,
        Self::ChartPayload,
        Self::OfficeXlsx,
        Self::OfficeDocx,
        Self::OfficePptx,
        Self::HtmlDefinitionList,
        Self::HtmlSpecTable,
        Self::MainArticle,
        Self::DynamicDom,
        Self::StaticDom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkJson => "network_json",
            Self::JsonLd => "json_ld",
            Self::Microdata => "microdata",
            Self::Opengraph => "opengraph",
            Self::EmbeddedStateJson => "embedded_state_json",
            Self::ScannedPdfOcr => "scanned_pdf_ocr",
            Self::PdfTable => "pdf_table",
            Self::PdfKv => "pdf_kv",
            Self::PdfText => "pdf_text",
            Self::ScreenshotCapture => "screenshot_capture",
            Self::ImageOcr => "image_ocr",
            Self::ChartPayload => "chart_payload",
            Self::OfficeXlsx => "office_xlsx",
            Self::OfficeDocx => "office_docx",
            Self::OfficePptx => "office_pptx",
            Self::HtmlDefinitionList => "html_definition_list",
            Self::HtmlSpecTable => "html_spec_table",
            Self::MainArticle => "main_article",
            Self::DynamicDom => "dynamic_dom",
            Self::StaticDom => "static_dom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|surface| surface.as_str() == needle)
    }
}

pub struct TaxonomyRule<T> {
    pub needles: &'static [&'static str],
    pub tag: T,
}

// Order matters: the first rule with any matching needle wins, so narrower
// method names sit above the generic ones they contain.
pub const PHASE_RULES: &[TaxonomyRule<ExtractionPhase>] = &[
    TaxonomyRule {
        needles: &["scanned_pdf", "pdf_ocr", "scanned"],
        tag: ExtractionPhase::ScannedPdfOcr,
    },
    TaxonomyRule {
        needles: &["image_ocr", "screenshot", "ocr"],
        tag: ExtractionPhase::ImageOcr,
    },
    TaxonomyRule {
        needles: &["chart", "plot", "graph_image", "graph_series"],
        tag: ExtractionPhase::ChartGraph,
    },
    TaxonomyRule {
        needles: &["office", "docx", "xlsx", "pptx", "excel", "spreadsheet", "msword"],
        tag: ExtractionPhase::OfficeMixedDoc,
    },
    TaxonomyRule {
        needles: &["pdf"],
        tag: ExtractionPhase::TextPdf,
    },
    TaxonomyRule {
        needles: &[
            "json", "microdata", "rdfa", "opengraph", "og_meta", "schema_org", "next_data",
            "graphql", "structured",
        ],
        tag: ExtractionPhase::EmbeddedJson,
    },
    TaxonomyRule {
        needles: &["spec_table", "table", "definition_list", "dl_"],
        tag: ExtractionPhase::HtmlSpecTable,
    },
    TaxonomyRule {
        needles: &["readability", "article", "main_content"],
        tag: ExtractionPhase::MainArticle,
    },
    TaxonomyRule {
        needles: &["dynamic", "playwright", "browser", "rendered", "dom", "js"],
        tag: ExtractionPhase::DynamicJs,
    },
];

pub const SURFACE_RULES: &[TaxonomyRule<SourceSurface>] = &[
    TaxonomyRule {
        needles: &["network_json", "xhr", "graphql", "api_response"],
        tag: SourceSurface::NetworkJson,
    },
    TaxonomyRule {
        needles: &["json_ld", "jsonld", "ld_json"],
        tag: SourceSurface::JsonLd,
    },
    TaxonomyRule {
        needles: &["microdata", "rdfa"],
        tag: SourceSurface::Microdata,
    },
    TaxonomyRule {
        needles: &["opengraph", "og_meta", "meta_tag"],
        tag: SourceSurface::Opengraph,
    },
    TaxonomyRule {
        needles: &["next_data", "nuxt", "embedded_json", "state_json", "inline_json", "json"],
        tag: SourceSurface::EmbeddedStateJson,
    },
    TaxonomyRule {
        needles: &["scanned_pdf", "pdf_ocr"],
        tag: SourceSurface::ScannedPdfOcr,
    },
    TaxonomyRule {
        needles: &["pdf_table"],
        tag: SourceSurface::PdfTable,
    },
    TaxonomyRule {
        needles: &["pdf_kv"],
        tag: SourceSurface::PdfKv,
    },
    TaxonomyRule {
        needles: &["pdf"],
        tag: SourceSurface::PdfText,
    },
    TaxonomyRule {
        needles: &["screenshot"],
        tag: SourceSurface::ScreenshotCapture,
    },
    TaxonomyRule {
        needles: &["image_ocr", "ocr"],
        tag: SourceSurface::ImageOcr,
    },
    TaxonomyRule {
        needles: &["chart", "plot", "graph_image", "graph_series"],
        tag: SourceSurface::ChartPayload,
    },
    TaxonomyRule {
        needles: &["xlsx", "excel", "spreadsheet", "csv"],
        tag: SourceSurface::OfficeXlsx,
    },
    TaxonomyRule {
        needles: &["docx", "msword", "word_doc"],
        tag: SourceSurface::OfficeDocx,
    },
    TaxonomyRule {
        needles: &["pptx", "powerpoint", "slide"],
        tag: SourceSurface::OfficePptx,
    },
    TaxonomyRule {
        needles: &["definition_list", "dl_"],
        tag: SourceSurface::HtmlDefinitionList,
    },
    TaxonomyRule {
        needles: &["spec_table", "html_table", "table"],
        tag: SourceSurface::HtmlSpecTable,
    },
    TaxonomyRule {
        needles: &["readability", "article", "main_content"],
        tag: SourceSurface::MainArticle,
    },
    TaxonomyRule {
        needles: &["dynamic", "playwright", "rendered", "dom", "js"],
        tag: SourceSurface::DynamicDom,
    },
];

pub fn classify<T: Copy>(rules: &[TaxonomyRule<T>], method: &str, fallback: T) -> T {
    let lowered = method.trim().to_ascii_lowercase();
    rules
        .iter()
        .find(|rule| rule.needles.iter().any(|needle| lowered.contains(needle)))
        .map(|rule| rule.tag)
        .unwrap_or(fallback)
}

pub fn classify_phase(explicit: Option<&str>, method: &str) -> ExtractionPhase {
    explicit
        .and_then(ExtractionPhase::parse)
        .unwrap_or_else(|| classify(PHASE_RULES, method, ExtractionPhase::StaticHtml))
}

pub fn classify_surface(explicit: Option<&str>, method: &str) -> SourceSurface {
    explicit
        .and_then(SourceSurface::parse)
        .unwrap_or_else(|| classify(SURFACE_RULES, method, SourceSurface::StaticDom))
}
