//! Fixed presentation tables for event codes and application codes.
//!
//! The platform renders these strings in its own log viewer; we reproduce
//! them so dashboards read the same. Codes without a known presentation
//! pass through unchanged.

/// Localized presentation of an event code such as `_$Session$_.Start`.
pub fn event_presentation(code: &str) -> &str {
    match code {
        "_$Access$_.Access" => "Доступ.Доступ",
        "_$Access$_.AccessDenied" => "Доступ.Отказ в доступе",
        "_$Data$_.Delete" => "Данные.Удаление",
        "_$Data$_.DeletePredefinedData" => "Данные.Удаление предопределенных данных",
        "_$Data$_.DeleteVersions" => "Данные.Удаление версий",
        "_$Data$_.New" => "Данные.Добавление",
        "_$Data$_.NewVersion" => "Данные.Добавление версии",
        "_$Data$_.Post" => "Данные.Проведение",
        "_$Data$_.TotalsMaxPeriodUpdate" => {
            "Данные.Изменение максимального периода рассчитанных итогов"
        }
        "_$Data$_.TotalsMinPeriodUpdate" => {
            "Данные.Изменение минимального периода рассчитанных итогов"
        }
        "_$Data$_.UnPost" => "Данные.Отмена проведения",
        "_$Data$_.Update" => "Данные.Изменение",
        "_$InfoBase$_.ConfigExtensionUpdate" => {
            "Информационная база.Изменение расширения конфигурации"
        }
        "_$InfoBase$_.ConfigUpdate" => "Информационная база.Изменение конфигурации",
        "_$InfoBase$_.DBConfigUpdate" => {
            "Информационная база.Изменение конфигурации базы данных"
        }
        "_$InfoBase$_.EventLogReduce" => "Информационная база.Сокращение журнала регистрации",
        "_$InfoBase$_.EventLogSettingsUpdate" => {
            "Информационная база.Изменение параметров журнала регистрации"
        }
        "_$InfoBase$_.InfoBaseAdmParamsUpdate" => {
            "Информационная база.Изменение параметров информационной базы"
        }
        "_$InfoBase$_.MasterNodeUpdate" => "Информационная база.Изменение главного узла",
        "_$InfoBase$_.RegionalSettingsUpdate" => {
            "Информационная база.Изменение региональных установок"
        }
        "_$Job$_.Cancel" => "Фоновое задание.Отмена",
        "_$Job$_.Fail" => "Фоновое задание.Ошибка выполнения",
        "_$Job$_.Start" => "Фоновое задание.Запуск",
        "_$Job$_.Succeed" => "Фоновое задание.Успешное завершение",
        "_$Job$_.Terminate" => "Фоновое задание.Принудительное завершение",
        "_$PerformError$_" => "Ошибка выполнения",
        "_$Session$_.Authentication" => "Сеанс.Аутентификация",
        "_$Session$_.AuthenticationError" => "Сеанс.Ошибка аутентификации",
        "_$Session$_.AuthenticationFirstFactor" => "Сеанс.Аутентификация первым фактором",
        "_$Session$_.Finish" => "Сеанс.Завершение",
        "_$Session$_.Start" => "Сеанс.Начало",
        "_$Transaction$_.Begin" => "Транзакция.Начало",
        "_$Transaction$_.Commit" => "Транзакция.Фиксация",
        "_$Transaction$_.Rollback" => "Транзакция.Отмена",
        "_$User$_.AuthenticationLock" => "Пользователи.Блокировка аутентификации",
        "_$User$_.AuthenticationUnlock" => "Пользователи.Разблокировка аутентификации",
        "_$User$_.Delete" => "Пользователи.Удаление",
        "_$User$_.DeleteError" => "Пользователи.Ошибка удаления",
        "_$User$_.New" => "Пользователи.Добавление",
        "_$User$_.NewError" => "Пользователи.Ошибка добавления",
        "_$User$_.Update" => "Пользователи.Изменение",
        "_$User$_.UpdateError" => "Пользователи.Ошибка изменения",
        other => other,
    }
}

/// Localized presentation of an application code such as `1CV8C`.
pub fn application_presentation(code: &str) -> &str {
    match code {
        "1CV8" => "Толстый клиент",
        "1CV8C" => "Тонкий клиент",
        "WebClient" => "Веб-клиент",
        "Designer" => "Конфигуратор",
        "COMConnection" => "Внешнее соединение (COM, обычное)",
        "COMConsole" => "Внешнее соединение (COM, административное)",
        "WSConnection" => "Сеанс web-сервиса",
        "BackgroundJob" => "Фоновое задание",
        "SystemBackgroundJob" => "Системное фоновое задание",
        "SrvrConsole" => "Консоль кластера",
        "JobScheduler" => "Планировщик заданий",
        "Debugger" => "Отладчик",
        "RAS" => "Сервер администрирования",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_localize() {
        assert_eq!(event_presentation("_$Session$_.Start"), "Сеанс.Начало");
        assert_eq!(application_presentation("1CV8C"), "Тонкий клиент");
    }

    #[test]
    fn unknown_codes_pass_through() {
        assert_eq!(event_presentation("_$Custom$_.Thing"), "_$Custom$_.Thing");
        assert_eq!(application_presentation("MyTool"), "MyTool");
    }
}
