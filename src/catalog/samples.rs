use serde_json::{json, Value};

/// Catalog used when no data directory is present.
pub fn sample_products() -> Vec<Value> {
    vec![
        json!({
            "id": "workstation-pro-1",
            "name": "Workstation Pro Professional",
            "category": "workstation",
            "subcategory": "professional",
            "description": "High-performance workstation for professional use",
            "specifications": {
                "cpu": "Intel Xeon W-2295",
                "ram": "32GB DDR4",
                "storage": "1TB NVMe SSD",
                "gpu": "NVIDIA Quadro RTX 4000"
            },
            "price": 3499.99,
            "currency": "USD",
            "availability": true,
            "tags": ["workstation", "professional", "high-performance"],
            "features": "High-performance CPU, Professional graphics, Fast storage",
            "use_cases": "CAD, 3D modeling, video editing, engineering",
            "target_industries": ["engineering", "media", "architecture"],
            "warranty": "3 years"
        }),
        json!({
            "id": "business-nas-4tb",
            "name": "Business NAS 4TB",
            "category": "storage",
            "subcategory": "network_storage",
            "description": "4TB Network Attached Storage for small business",
            "specifications": {
                "capacity": "4TB",
                "raid": "RAID 1",
                "connectivity": "Gigabit Ethernet",
                "bays": 2
            },
            "price": 899.99,
            "currency": "USD",
            "availability": true,
            "tags": ["storage", "nas", "business", "backup"],
            "features": "RAID protection, Remote access, Automatic backup",
            "use_cases": "File sharing, backup, remote access",
            "target_industries": ["general", "small_business"],
            "warranty": "2 years"
        }),
        json!({
            "id": "server-rack-2u",
            "name": "Enterprise Server 2U Rack",
            "category": "server",
            "subcategory": "rack_server",
            "description": "2U rack-mounted server for enterprise applications",
            "specifications": {
                "cpu": "Dual Intel Xeon Gold 6248R",
                "ram": "128GB DDR4 ECC",
                "storage": "8TB SAS RAID 10",
                "networking": "Dual 10GbE ports"
            },
            "price": 8999.99,
            "currency": "USD",
            "availability": true,
            "tags": ["server", "enterprise", "rack", "high-availability"],
            "features": "Dual redundant power, Hot-swappable drives, Remote management",
            "use_cases": "Database hosting, virtualization, enterprise applications",
            "target_industries": ["enterprise", "healthcare", "finance"],
            "warranty": "5 years"
        }),
    ]
}

pub fn sample_solutions() -> Vec<Value> {
    vec![
        json!({
            "id": "small-office-setup",
            "name": "Small Office Complete Setup",
            "description": "Complete technology solution for small offices (5-15 employees)",
            "use_case": "Small business productivity and collaboration",
            "industry": ["general", "professional_services", "consulting"],
            "company_size": "small",
            "budget_range": "10000-25000",
            "components": [
                {"type": "workstation", "quantity": 5, "name": "Workstation Pro Professional"},
                {"type": "storage", "quantity": 1, "name": "Business NAS 4TB"}
            ],
            "total_price": 18399.95,
            "implementation_time": "1-2 weeks",
            "benefits": "Complete productivity suite, secure file sharing, professional support",
            "requirements": "Standard office space, internet connection"
        }),
        json!({
            "id": "enterprise-infrastructure",
            "name": "Enterprise Infrastructure Solution",
            "description": "Scalable enterprise infrastructure for large organizations",
            "use_case": "Enterprise data center and application hosting",
            "industry": ["enterprise", "healthcare", "finance", "government"],
            "company_size": "large",
            "budget_range": "50000-100000",
            "components": [
                {"type": "server", "quantity": 3, "name": "Enterprise Server 2U Rack"},
                {"type": "storage", "quantity": 2, "name": "Business NAS 4TB"}
            ],
            "total_price": 28799.95,
            "implementation_time": "2-4 weeks",
            "benefits": "High availability, scalable performance, enterprise support",
            "requirements": "Data center rack space, redundant power, network infrastructure"
        }),
    ]
}
